use ledgerlens_core::{IngestConfig, IngestionProgress, SessionManager, Warehouse};
use tokio::sync::watch;

use crate::cli::IngestArgs;
use crate::error::CliError;

use super::{parse_session, CommandResult};

pub async fn run(
    args: &IngestArgs,
    warehouse: &Warehouse,
    progress: Option<&watch::Sender<IngestionProgress>>,
) -> Result<CommandResult, CliError> {
    let session = parse_session(&args.session)?;
    let config = ingest_config(args)?;
    let manager = SessionManager::new(warehouse.clone(), config);

    let report = manager.ingest_csv(&session, &args.path, progress).await?;

    let mut result = CommandResult::ok(serde_json::to_value(&report)?);
    if !report.aggregates_fresh {
        result = result.with_warning(
            "ledger loaded but session aggregates could not be refreshed; summaries may be stale",
        );
    }
    let retries = report.attempts.saturating_sub(u32::try_from(report.batches).unwrap_or(u32::MAX));
    if retries > 0 {
        result = result.with_warning(format!("{retries} batch attempt(s) were retried"));
    }
    Ok(result)
}

fn ingest_config(args: &IngestArgs) -> Result<IngestConfig, CliError> {
    let mut config = IngestConfig::from_env()?;
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(attempts) = args.max_attempts {
        config = config.with_max_attempts(attempts);
    }
    config.validate()?;
    Ok(config)
}
