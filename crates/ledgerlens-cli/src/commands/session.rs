use ledgerlens_core::SessionManager;
use serde_json::json;

use crate::cli::{SessionArgs, SessionCommand};
use crate::error::CliError;

use super::{parse_session, CommandResult};

pub async fn run(args: &SessionArgs, manager: &SessionManager) -> Result<CommandResult, CliError> {
    match &args.command {
        SessionCommand::Create => {
            let session = manager.create_session().await?;
            Ok(CommandResult::ok(json!({ "session": session })))
        }
        SessionCommand::Status(target) => {
            let session = parse_session(&target.session)?;
            let status = manager.status(&session).await?;
            let mut result = CommandResult::ok(serde_json::to_value(&status)?);
            if !status.exists {
                result = result.with_warning(format!("session {session} has no dataset"));
            } else if status.aggregates.is_none() {
                result = result.with_warning("session aggregates have not been refreshed");
            }
            Ok(result)
        }
        SessionCommand::Clear(target) => {
            let session = parse_session(&target.session)?;
            manager.clear_session(&session).await?;
            Ok(CommandResult::ok(json!({ "session": session, "cleared": true })))
        }
        SessionCommand::Drop(target) => {
            let session = parse_session(&target.session)?;
            manager.end_session(&session).await?;
            Ok(CommandResult::ok(json!({ "session": session, "dropped": true })))
        }
    }
}
