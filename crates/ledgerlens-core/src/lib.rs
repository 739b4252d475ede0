//! Core services for ledgerlens.
//!
//! This crate contains:
//! - Ledger parsing and row-level validation
//! - The batched, retrying ingestion pipeline
//! - Session lifecycle management and session events
//! - The analysis workbook over every growth metric

pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod ledger;
pub mod retry;
pub mod session;
pub mod workbook;

pub use config::IngestConfig;
pub use error::{CoreError, IngestError, ValidationError};
pub use events::{ChannelEventSink, EventSink, SessionEvent, TracingEventSink};
pub use ingest::{
    progress_channel, IngestionPipeline, IngestionProgress, IngestionReport, IngestionState,
};
pub use ledger::{Ledger, RawRow, REQUIRED_COLUMNS};
pub use ledgerlens_warehouse::activity::build_daily_activity;
pub use ledgerlens_warehouse::{
    ActivityStatus, ComposedQuery, Composer, DailyActivityRow, DatasetStore, DateRange,
    Dependency, Granularity, Materialization, MetricCatalog, MetricCatalogBuilder, MetricFamily,
    MetricQueryTemplate, QueryGuardrails, QueryResult, SessionAggregates, SessionId, SqlColumn,
    TransactionRecord, Warehouse, WarehouseConfig, WarehouseError,
};
pub use retry::{retry_with_backoff, Backoff, Exhausted, RetryConfig, Retryable};
pub use session::{SessionManager, SessionStatus};
pub use workbook::{Workbook, WorkbookSheet};
