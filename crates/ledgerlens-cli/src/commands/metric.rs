use ledgerlens_core::{Composer, Granularity, Materialization, SessionManager};
use serde_json::json;

use crate::cli::MetricArgs;
use crate::error::CliError;

use super::{parse_date, parse_session, CommandResult};

pub async fn run(args: &MetricArgs, manager: &SessionManager) -> Result<CommandResult, CliError> {
    let session = parse_session(&args.session)?;
    let granularity = Granularity::from(args.window.granularity);
    let start = parse_date(&args.window.start)?;
    let end = parse_date(&args.window.end)?;

    let manager = if args.inline {
        let composer = Composer::standard(manager.composer().warehouse().clone())
            .with_materialization(Materialization::Inline);
        manager.clone().with_composer(composer)
    } else {
        manager.clone()
    };

    let result = manager
        .run_metric(&session, &args.name, granularity, start, end)
        .await?;
    let truncated = result.truncated;
    let row_count = result.row_count;
    let empty = result.is_empty();

    let data = json!({
        "session": session,
        "metric": args.name,
        "granularity": granularity,
        "start": start.to_string(),
        "end": end.to_string(),
        "columns": result.columns,
        "rows": result.rows,
        "row_count": row_count,
        "truncated": truncated,
    });

    let mut command_result = CommandResult::ok(data);
    if truncated {
        command_result = command_result.with_warning(format!("result truncated at {row_count} rows"));
    }
    if empty {
        command_result = command_result.with_warning("no rows in the requested window");
    }
    Ok(command_result)
}
