//! # Ledgerlens Warehouse
//!
//! DuckDB-based storage and query composition for session-scoped growth metrics.
//!
//! ## Overview
//!
//! This crate owns everything that touches the database:
//!
//! - **Dataset Store** ([`DatasetStore`]): one shared `transactions` relation
//!   partitioned by session id, with full-replacement and batched writes
//! - **Derived Aggregate Builder** ([`activity`]): per-user, per-day activity with
//!   new/retained/resurrected/churned classification
//! - **Metric Query Catalog** ([`MetricCatalog`]): immutable query templates, one per
//!   metric family and granularity, each declaring its dependency
//! - **Query Composer** ([`Composer`]): resolves a template's dependency chain into one
//!   statement, binds the session and date window, and cleans up scratch relations
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ledgerlens_warehouse::{
//!     Composer, DatasetStore, Granularity, SessionId, TransactionRecord, Warehouse,
//!     WarehouseConfig,
//! };
//! use time::macros::date;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let warehouse = Warehouse::open(WarehouseConfig::in_memory())?;
//!     let session = SessionId::generate();
//!     warehouse.initialize_session(&session)?;
//!
//!     warehouse.replace_all(&session, &[TransactionRecord {
//!         transaction_date: date!(2024 - 01 - 15),
//!         transaction_id: "tx-1".to_string(),
//!         revenue: 49.0,
//!         user_id: "user-1".to_string(),
//!     }])?;
//!
//!     let composer = Composer::standard(warehouse);
//!     let rows = composer.run_metric(
//!         &session,
//!         "activity_trend",
//!         Granularity::Month,
//!         date!(2024 - 01 - 01),
//!         date!(2024 - 12 - 31),
//!     )?;
//!     println!("{} periods", rows.row_count);
//!     Ok(())
//! }
//! ```
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `sessions` | Registry of materialized sessions |
//! | `transactions` | Raw ledger rows, keyed by `session_id` |
//! | `session_aggregates` | Per-session summary refreshed after each upload |
//! | `schema_migrations` | Applied migration versions |

pub mod activity;
pub mod catalog;
pub mod composer;
pub mod duckdb;
pub mod granularity;
pub mod migrations;
pub mod query;
pub mod session;
pub mod store;
mod templates;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use time::Date;

pub use activity::{ActivityStatus, DailyActivityRow};
pub use catalog::{
    Dependency, MetricCatalog, MetricCatalogBuilder, MetricFamily, MetricQueryTemplate,
};
pub use composer::{ComposedQuery, Composer, Materialization, Stage};
pub use duckdb::{DatabaseLocation, DuckDbConnectionManager, PooledConnection};
pub use granularity::Granularity;
pub use session::SessionId;
pub use store::{DatasetStore, SessionAggregates, TransactionRecord};

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Query was rejected due to policy violation.
    #[error("query rejected: {0}")]
    QueryRejected(String),

    /// Query execution timed out.
    #[error("query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("invalid granularity '{0}', expected one of day, week, month")]
    InvalidGranularity(String),

    /// A record violates the transaction schema invariants.
    #[error("invalid transaction '{transaction_id}': {reason}")]
    InvalidRecord {
        transaction_id: String,
        reason: String,
    },

    /// A transaction id occurs more than once within one session.
    #[error("duplicate transaction id '{transaction_id}'")]
    DuplicateKey { transaction_id: String },

    /// The store failed in a way that may succeed on retry.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The store rejected a composed metric statement.
    #[error("metric '{metric}' failed to execute: {source}")]
    QueryExecution {
        metric: String,
        #[source]
        source: ::duckdb::Error,
    },

    #[error("invalid date range: start {start} is after end {end}")]
    InvalidRange { start: Date, end: Date },

    #[error("unknown metric '{name}' at {granularity} granularity")]
    UnknownMetric {
        name: String,
        granularity: Granularity,
    },

    /// The metric catalog is inconsistent.
    #[error("catalog error: {0}")]
    Catalog(String),
}

impl WarehouseError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Io(_))
    }

    /// Classify a raw store error raised by a write path.
    pub(crate) fn from_store(error: ::duckdb::Error) -> Self {
        let message = error.to_string();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("conflict")
            || lowered.contains("could not set lock")
            || lowered.contains("interrupted")
        {
            Self::Transient(message)
        } else {
            Self::DuckDb(error)
        }
    }
}

/// Inclusive window of dates used to filter metric output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: Date,
    pub end: Date,
}

impl DateRange {
    /// # Errors
    /// Returns [`WarehouseError::InvalidRange`] when `start > end`.
    pub fn new(start: Date, end: Date) -> Result<Self, WarehouseError> {
        if start > end {
            return Err(WarehouseError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: Date) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Configuration for the warehouse database.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Root directory for ledgerlens data.
    pub ledgerlens_home: PathBuf,
    /// Database file or in-memory database.
    pub location: DatabaseLocation,
    /// Maximum number of idle connections kept in the pool.
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        let ledgerlens_home = resolve_ledgerlens_home();
        let db_path = ledgerlens_home.join("cache").join("warehouse.duckdb");
        Self {
            ledgerlens_home,
            location: DatabaseLocation::File(db_path),
            max_pool_size: 8,
        }
    }
}

impl WarehouseConfig {
    /// Configuration for a file database at `db_path`.
    pub fn at_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            location: DatabaseLocation::File(db_path.into()),
            ..Self::default()
        }
    }

    /// Configuration for a private in-memory database.
    pub fn in_memory() -> Self {
        Self {
            location: DatabaseLocation::InMemory,
            ..Self::default()
        }
    }
}

/// Guardrails for query execution to prevent resource exhaustion.
///
/// Metric queries return every row unless a caller sets `max_rows`.
#[derive(Debug, Clone, Copy)]
pub struct QueryGuardrails {
    /// Maximum number of rows to return, if any.
    pub max_rows: Option<usize>,
    /// Query timeout in milliseconds.
    pub query_timeout_ms: u64,
}

impl Default for QueryGuardrails {
    fn default() -> Self {
        Self {
            max_rows: None,
            query_timeout_ms: 5_000,
        }
    }
}

impl QueryGuardrails {
    /// Convert to Duration for timeout enforcement.
    fn timeout(self) -> Duration {
        Duration::from_millis(self.query_timeout_ms.max(1))
    }

    /// Validate that guardrails are within acceptable bounds.
    fn validate(self) -> Result<(), WarehouseError> {
        if self.max_rows == Some(0) {
            return Err(WarehouseError::QueryRejected(String::from(
                "max_rows must be greater than zero",
            )));
        }
        if self.query_timeout_ms == 0 {
            return Err(WarehouseError::QueryRejected(String::from(
                "query_timeout_ms must be greater than zero",
            )));
        }
        Ok(())
    }
}

/// Column metadata for query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlColumn {
    /// Column name.
    pub name: String,
    /// Column data type.
    #[serde(rename = "type")]
    pub r#type: String,
}

/// Result of a metric query: an ordered sequence of rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    /// Column definitions.
    pub columns: Vec<SqlColumn>,
    /// Row data as JSON values.
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Number of rows returned.
    pub row_count: usize,
    /// Whether results were cut at the `max_rows` guardrail.
    pub truncated: bool,
}

impl QueryResult {
    /// Empty result, used when a session has no data.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Vec<&serde_json::Value> {
        match self.column_index(name) {
            Some(index) => self.rows.iter().filter_map(|row| row.get(index)).collect(),
            None => Vec::new(),
        }
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(column, value)| (column.name.clone(), value.clone()))
                    .collect()
            })
            .collect()
    }
}

/// The DuckDB-backed warehouse.
#[derive(Clone)]
pub struct Warehouse {
    manager: DuckDbConnectionManager,
    guardrails: QueryGuardrails,
    write_locks: store::SessionWriteLocks,
}

impl Warehouse {
    /// Open a warehouse with default configuration.
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    /// Open a warehouse with the specified configuration.
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let DatabaseLocation::File(path) = &config.location {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = DuckDbConnectionManager::open(config.location, config.max_pool_size)?;
        let warehouse = Self {
            manager,
            guardrails: QueryGuardrails::default(),
            write_locks: store::SessionWriteLocks::default(),
        };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    /// Replace the guardrails applied to metric queries.
    #[must_use]
    pub fn with_guardrails(mut self, guardrails: QueryGuardrails) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn guardrails(&self) -> QueryGuardrails {
        self.guardrails
    }

    /// Initialize database schema.
    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    /// Get the path to the database file, if file-backed.
    pub fn db_path(&self) -> Option<&Path> {
        self.manager.db_path()
    }

    pub(crate) fn connection(&self) -> Result<PooledConnection, WarehouseError> {
        Ok(self.manager.acquire()?)
    }

    /// Names of temporary relations currently alive on a pooled connection.
    ///
    /// Scratch relations are connection-local; with sequential use the pool hands
    /// back the same connection, so this reveals leaks from earlier calls.
    pub fn scratch_relations(&self) -> Result<Vec<String>, WarehouseError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT table_name FROM duckdb_tables() WHERE temporary ORDER BY table_name",
        )?;
        let names = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

/// Resolve the ledgerlens home directory from environment or default.
fn resolve_ledgerlens_home() -> PathBuf {
    if let Some(path) = env::var_os("LEDGERLENS_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".ledgerlens");
    }

    PathBuf::from(".ledgerlens")
}
