mod cli;
mod commands;
mod envelope;
mod error;
mod output;

use std::process::ExitCode;

use clap::Parser;
use ledgerlens_core::progress_channel;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::error::CliError;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();

    if !cli.stream {
        let envelope = commands::run(&cli, None).await?;
        return output::render(&envelope, cli.format, cli.pretty);
    }

    let (progress, receiver) = progress_channel();
    let forward = tokio::spawn(output::forward_progress(
        receiver,
        commands::command_name(&cli.command),
    ));
    let outcome = commands::run(&cli, Some(progress)).await;
    let mut writer = forward
        .await
        .map_err(|error| CliError::Command(format!("progress stream stopped: {error}")))??;

    output::finish_stream(&mut writer, &outcome)?;
    outcome.map(|_| ())
}
