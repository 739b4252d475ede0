//! CLI argument definitions for ledgerlens.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `session` | Create, inspect, clear, or drop a session |
//! | `ingest` | Load a CSV ledger into a session |
//! | `metric` | Run one growth metric for a session |
//! | `workbook` | Run every growth metric for one granularity |
//! | `catalog` | List registered metric templates |
//! | `explain` | Print the composed SQL for a metric |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--format` | `json` | Output format (json, ndjson, table) |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--stream` | `false` | Emit NDJSON progress events |
//! | `--db` | `~/.ledgerlens/cache/warehouse.duckdb` | Warehouse file |
//! | `--max-rows` | none | Row limit per metric |
//! | `--query-timeout-ms` | `5000` | Metric query timeout |
//!
//! # Examples
//!
//! ```bash
//! ledgerlens session create
//! ledgerlens ingest 6f1c... ./ledger.csv --stream
//! ledgerlens metric 6f1c... quick_ratio --granularity month --start 2024-01-01 --end 2024-12-31
//! ledgerlens explain cohort_ltv --granularity week
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Session-scoped growth metrics over transaction ledgers.
#[derive(Debug, Parser)]
#[command(name = "ledgerlens", author, version, about = "Growth metrics over transaction ledgers")]
pub struct Cli {
    /// Output format for results.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Emit NDJSON start/progress/chunk/end events.
    #[arg(long, global = true, default_value_t = false)]
    pub stream: bool,

    /// Warehouse database file.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Maximum rows returned per metric (all rows when omitted).
    #[arg(long, global = true)]
    pub max_rows: Option<usize>,

    /// Metric query timeout in milliseconds.
    #[arg(long, global = true, default_value_t = 5_000)]
    pub query_timeout_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format for terminal display.
    Table,
    /// Single JSON object output.
    Json,
    /// Newline-delimited JSON (one object per line).
    Ndjson,
}

/// Metric granularity accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GranularityArg {
    Day,
    Week,
    Month,
}

/// Available CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage sessions.
    Session(SessionArgs),

    /// Load a CSV ledger, replacing the session's dataset.
    ///
    /// The file needs the columns date, id, revenue, and user_id.
    ///
    /// # Examples
    ///
    ///   ledgerlens ingest <session> ./ledger.csv
    ///   ledgerlens ingest <session> ./ledger.csv --batch-size 500 --stream
    Ingest(IngestArgs),

    /// Run one metric for a session.
    Metric(MetricArgs),

    /// Run every growth metric for one granularity.
    Workbook(WorkbookArgs),

    /// List registered metric templates.
    Catalog(CatalogArgs),

    /// Print the composed statements for a metric without running them.
    Explain(ExplainArgs),
}

#[derive(Debug, Args)]
pub struct SessionArgs {
    #[command(subcommand)]
    pub command: SessionCommand,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Register a new, empty session and print its id.
    Create,
    /// Show row counts and aggregates.
    Status(SessionTarget),
    /// Remove the session's rows but keep the session.
    Clear(SessionTarget),
    /// Remove the session and everything stored for it.
    Drop(SessionTarget),
}

#[derive(Debug, Args)]
pub struct SessionTarget {
    /// Session identifier.
    pub session: String,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Session identifier.
    pub session: String,

    /// CSV file to load.
    pub path: PathBuf,

    /// Rows per batch write.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Batches written concurrently.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Attempts per batch, including the first.
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Args)]
pub struct WindowArgs {
    /// Metric granularity.
    #[arg(long, value_enum, default_value_t = GranularityArg::Month)]
    pub granularity: GranularityArg,

    /// First date of the window (YYYY-MM-DD, inclusive).
    #[arg(long)]
    pub start: String,

    /// Last date of the window (YYYY-MM-DD, inclusive).
    #[arg(long)]
    pub end: String,
}

#[derive(Debug, Args)]
pub struct MetricArgs {
    /// Session identifier.
    pub session: String,

    /// Metric name, for example `activity_trend` or `cohort_ltv`.
    pub name: String,

    #[command(flatten)]
    pub window: WindowArgs,

    /// Compose upstream stages as CTEs instead of a scratch table.
    #[arg(long, default_value_t = false)]
    pub inline: bool,
}

#[derive(Debug, Args)]
pub struct WorkbookArgs {
    /// Session identifier.
    pub session: String,

    #[command(flatten)]
    pub window: WindowArgs,
}

#[derive(Debug, Args)]
pub struct CatalogArgs {
    /// Only list templates at this granularity.
    #[arg(long, value_enum)]
    pub granularity: Option<GranularityArg>,
}

#[derive(Debug, Args)]
pub struct ExplainArgs {
    /// Metric name.
    pub name: String,

    /// Metric granularity.
    #[arg(long, value_enum, default_value_t = GranularityArg::Month)]
    pub granularity: GranularityArg,

    /// Compose upstream stages as CTEs instead of a scratch table.
    #[arg(long, default_value_t = false)]
    pub inline: bool,
}
