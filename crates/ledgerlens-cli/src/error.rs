use ledgerlens_core::{CoreError, IngestError, WarehouseError};
use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("command error: {0}")]
    Command(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Stable machine-readable category, used in stream error events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Core(CoreError::Validation(_))
            | Self::Core(CoreError::Ingest(IngestError::Validation(_))) => "invalid_ledger",
            Self::Core(CoreError::Ingest(IngestError::BatchFailed { .. })) => "partial_ingestion",
            Self::Core(CoreError::Warehouse(error)) | Self::Warehouse(error) => warehouse_code(error),
            Self::Core(CoreError::Config(_)) | Self::Command(_) => "invalid_arguments",
            Self::Core(_) => "ingestion_failed",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            Self::Core(error) => error.is_transient(),
            Self::Warehouse(error) => error.is_transient(),
            _ => false,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.code() {
            "invalid_ledger" | "invalid_arguments" | "invalid_request" => 2,
            "partial_ingestion" => 3,
            "serialization" => 4,
            "query_failed" => 6,
            _ => 10,
        }
    }
}

fn warehouse_code(error: &WarehouseError) -> &'static str {
    match error {
        WarehouseError::InvalidSessionId(_)
        | WarehouseError::InvalidGranularity(_)
        | WarehouseError::InvalidRange { .. }
        | WarehouseError::UnknownMetric { .. } => "invalid_request",
        WarehouseError::QueryExecution { .. }
        | WarehouseError::QueryRejected(_)
        | WarehouseError::QueryTimeout { .. } => "query_failed",
        _ => "storage",
    }
}
