mod catalog;
mod ingest;
mod metric;
mod session;
mod workbook;

use std::time::Instant;

use ledgerlens_core::{
    Granularity, IngestConfig, IngestionProgress, QueryGuardrails, SessionId, SessionManager,
    Warehouse, WarehouseConfig,
};
use serde_json::Value;
use time::macros::format_description;
use time::Date;
use tokio::sync::watch;

use crate::cli::{Cli, Command, GranularityArg, SessionCommand};
use crate::envelope::{Envelope, Metadata};
use crate::error::CliError;

pub struct CommandResult {
    pub data: Value,
    pub warnings: Vec<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

pub async fn run(
    cli: &Cli,
    progress: Option<watch::Sender<IngestionProgress>>,
) -> Result<Envelope, CliError> {
    let started = Instant::now();
    let command = command_name(&cli.command);

    let result = match &cli.command {
        Command::Session(args) => session::run(args, &open_manager(cli)?).await?,
        Command::Ingest(args) => ingest::run(args, &open_warehouse(cli)?, progress.as_ref()).await?,
        Command::Metric(args) => metric::run(args, &open_manager(cli)?).await?,
        Command::Workbook(args) => workbook::run(args, &open_manager(cli)?).await?,
        Command::Catalog(args) => catalog::list(args)?,
        Command::Explain(args) => catalog::explain(args)?,
    };
    drop(progress);

    let CommandResult { data, warnings } = result;
    let mut meta = Metadata::new(command, elapsed_ms(started));
    for warning in warnings {
        meta.push_warning(warning);
    }

    Ok(Envelope { meta, data })
}

pub fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Session(args) => match args.command {
            SessionCommand::Create => "session.create",
            SessionCommand::Status(_) => "session.status",
            SessionCommand::Clear(_) => "session.clear",
            SessionCommand::Drop(_) => "session.drop",
        },
        Command::Ingest(_) => "ingest",
        Command::Metric(_) => "metric",
        Command::Workbook(_) => "workbook",
        Command::Catalog(_) => "catalog",
        Command::Explain(_) => "explain",
    }
}

fn open_warehouse(cli: &Cli) -> Result<Warehouse, CliError> {
    let config = match &cli.db {
        Some(path) => WarehouseConfig::at_path(path.clone()),
        None => WarehouseConfig::default(),
    };
    let guardrails = QueryGuardrails {
        max_rows: cli.max_rows,
        query_timeout_ms: cli.query_timeout_ms,
    };
    Ok(Warehouse::open(config)?.with_guardrails(guardrails))
}

fn open_manager(cli: &Cli) -> Result<SessionManager, CliError> {
    let config = IngestConfig::from_env()?;
    Ok(SessionManager::new(open_warehouse(cli)?, config))
}

fn parse_session(value: &str) -> Result<SessionId, CliError> {
    Ok(SessionId::parse(value)?)
}

fn parse_date(value: &str) -> Result<Date, CliError> {
    Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|_| CliError::Command(format!("'{value}' is not a YYYY-MM-DD date")))
}

impl From<GranularityArg> for Granularity {
    fn from(value: GranularityArg) -> Self {
        match value {
            GranularityArg::Day => Self::Day,
            GranularityArg::Week => Self::Week,
            GranularityArg::Month => Self::Month,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}
