use ledgerlens_warehouse::{SessionId, WarehouseError};
use thiserror::Error;

/// Problems with the shape or contents of an uploaded ledger.
///
/// These are user-fixable and never retried. Row numbers are 1-based and count
/// data rows only (the header is not a row).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("upload is {size} bytes, above the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("missing required columns: {}", .columns.join(", "))]
    MissingColumns { columns: Vec<String> },
    #[error("could not read ledger: {reason}")]
    Unreadable { reason: String },

    #[error("row {row}: field '{field}' must not be empty")]
    EmptyField { row: usize, field: &'static str },
    #[error("row {row}: '{value}' is not an ISO-8601 date")]
    InvalidDate { row: usize, value: String },
    #[error("row {row}: date {value} is in the future")]
    FutureDate { row: usize, value: String },
    #[error("row {row}: '{value}' is not a number")]
    InvalidRevenue { row: usize, value: String },
    #[error("row {row}: revenue must be finite")]
    NonFiniteRevenue { row: usize },
    #[error("row {row}: revenue must be non-negative")]
    NegativeRevenue { row: usize },
    #[error("row {row}: revenue '{value}' has more than two decimal places")]
    RevenuePrecision { row: usize, value: String },

    #[error("row {row}: duplicate transaction id '{transaction_id}'")]
    DuplicateKey { row: usize, transaction_id: String },
}

/// Failure of an ingestion run.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The ledger was rejected before any write.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The session could not be cleared before loading.
    #[error("could not prepare session {session}: {source}")]
    Prepare {
        session: SessionId,
        #[source]
        source: WarehouseError,
    },

    /// A batch exhausted its attempts; data committed so far is left in place.
    #[error(
        "batch {batch} of {total_batches} failed after {attempts} attempt(s) with {rows_committed} rows committed: {source}",
        batch = .batch_index + 1
    )]
    BatchFailed {
        /// Zero-based index of the lowest failed batch.
        batch_index: usize,
        total_batches: usize,
        /// Rows in the contiguous run of committed batches before `batch_index`.
        rows_committed: u64,
        /// Every row committed by any batch, including ones after the failure.
        rows_written: u64,
        attempts: u32,
        #[source]
        source: WarehouseError,
    },

    #[error("ingestion task failed: {0}")]
    Task(String),
}

impl IngestError {
    /// Rows known to be committed when the run stopped.
    pub fn rows_committed(&self) -> u64 {
        match self {
            Self::BatchFailed { rows_committed, .. } => *rows_committed,
            _ => 0,
        }
    }
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl CoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Warehouse(error) if error.is_transient())
    }
}
