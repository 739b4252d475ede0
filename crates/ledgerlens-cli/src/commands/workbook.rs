use ledgerlens_core::{Granularity, SessionManager};

use crate::cli::WorkbookArgs;
use crate::error::CliError;

use super::{parse_date, parse_session, CommandResult};

pub async fn run(args: &WorkbookArgs, manager: &SessionManager) -> Result<CommandResult, CliError> {
    let session = parse_session(&args.session)?;
    let granularity = Granularity::from(args.window.granularity);
    let start = parse_date(&args.window.start)?;
    let end = parse_date(&args.window.end)?;

    let workbook = manager.workbook(&session, granularity, start, end).await?;
    let mut result = CommandResult::ok(workbook.to_json());
    for sheet in workbook.sheets.iter().filter(|sheet| sheet.result.truncated) {
        result = result.with_warning(format!(
            "{} truncated at {} rows",
            sheet.family, sheet.result.row_count
        ));
    }
    Ok(result)
}
