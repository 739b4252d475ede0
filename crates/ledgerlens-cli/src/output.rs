pub mod stream_writer;

use std::io::{self, Stdout};

use ledgerlens_core::IngestionProgress;
use serde_json::{json, Value};
use tokio::sync::watch;

use self::stream_writer::{NdjsonStreamWriter, StreamEventError};
use crate::cli::OutputFormat;
use crate::envelope::Envelope;
use crate::error::CliError;

pub fn render(envelope: &Envelope, format: OutputFormat, pretty: bool) -> Result<(), CliError> {
    match format {
        OutputFormat::Json => {
            let payload = if pretty {
                serde_json::to_string_pretty(envelope)?
            } else {
                serde_json::to_string(envelope)?
            };
            println!("{payload}");
        }
        OutputFormat::Ndjson => render_ndjson(envelope)?,
        OutputFormat::Table => render_table(envelope)?,
    }

    Ok(())
}

/// Write the `start` event, then one `progress` event per ingestion state change
/// until the sender is dropped.
pub async fn forward_progress(
    mut receiver: watch::Receiver<IngestionProgress>,
    command: &'static str,
) -> Result<NdjsonStreamWriter<Stdout>, CliError> {
    let mut writer = NdjsonStreamWriter::new(io::stdout());
    writer.emit_start(Some(json!({ "command": command })))?;

    while receiver.changed().await.is_ok() {
        let progress = *receiver.borrow_and_update();
        writer.emit_progress(Some(serde_json::to_value(progress)?))?;
    }

    Ok(writer)
}

/// Close a stream with either the result chunk or an error event.
pub fn finish_stream(
    writer: &mut NdjsonStreamWriter<Stdout>,
    outcome: &Result<Envelope, CliError>,
) -> Result<(), CliError> {
    match outcome {
        Ok(envelope) => {
            writer.emit_chunk(Some(serde_json::to_value(envelope)?))?;
            writer.emit_end(Some(json!({
                "status": "ok",
                "warning_count": envelope.meta.warnings.len(),
            })))
        }
        Err(error) => {
            let stream_error = StreamEventError::new(error.code(), error.to_string())
                .with_retryable(error.retryable());
            writer.emit_error(stream_error, None)?;
            writer.emit_end(Some(json!({ "status": "error" })))
        }
    }
}

/// Tabular results print one record per line; everything else prints the envelope.
fn render_ndjson(envelope: &Envelope) -> Result<(), CliError> {
    match table_parts(&envelope.data) {
        Some((columns, rows)) => {
            for row in &rows {
                let record: serde_json::Map<String, Value> = columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        None => println!("{}", serde_json::to_string(envelope)?),
    }
    Ok(())
}

fn render_table(envelope: &Envelope) -> Result<(), CliError> {
    println!("request_id  : {}", envelope.meta.request_id);
    println!("command     : {}", envelope.meta.command);
    println!("generated_at: {}", envelope.meta.generated_at);
    println!("latency_ms  : {}", envelope.meta.latency_ms);

    if !envelope.meta.warnings.is_empty() {
        println!("warnings:");
        for warning in &envelope.meta.warnings {
            println!("  - {warning}");
        }
    }

    match table_parts(&envelope.data) {
        Some((columns, rows)) => {
            let cells: Vec<Vec<String>> = rows
                .iter()
                .map(|row| row.iter().map(format_cell).collect())
                .collect();
            for line in format_table(&columns, &cells) {
                println!("{line}");
            }
        }
        None => {
            println!("data:");
            let pretty_data = serde_json::to_string_pretty(&envelope.data)?;
            for line in pretty_data.lines() {
                println!("  {line}");
            }
        }
    }

    Ok(())
}

fn table_parts(data: &Value) -> Option<(Vec<String>, Vec<Vec<Value>>)> {
    let columns = data
        .get("columns")?
        .as_array()?
        .iter()
        .map(|column| column.get("name").and_then(Value::as_str).map(str::to_owned))
        .collect::<Option<Vec<_>>>()?;
    let rows = data
        .get("rows")?
        .as_array()?
        .iter()
        .map(|row| row.as_array().cloned())
        .collect::<Option<Vec<_>>>()?;
    Some((columns, rows))
}

fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => String::from("null"),
        Value::String(text) => text.clone(),
        Value::Number(number) => match number.as_f64() {
            Some(float) if number.is_f64() => format!("{float:.4}"),
            _ => number.to_string(),
        },
        _ => value.to_string(),
    }
}

fn format_table(columns: &[String], rows: &[Vec<String>]) -> Vec<String> {
    let mut widths: Vec<usize> = columns.iter().map(String::len).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let render_row = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}", width = *width))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_owned()
    };

    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(render_row(columns));
    lines.push(
        widths
            .iter()
            .map(|width| "-".repeat(*width))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    lines.extend(rows.iter().map(|row| render_row(row.as_slice())));
    lines
}
