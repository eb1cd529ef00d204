use anyhow::{Context, Result};
use serde_json::json;

use crate::cli::types::{JobCommands, QueueLocation};
use crate::cli::{AppContext, CommandOutput};
use crate::domain::models::{Job, JobLocation};
use crate::infrastructure::storage::JobQueue;
use crate::services::DispatchLedger;

impl From<QueueLocation> for JobLocation {
    fn from(location: QueueLocation) -> Self {
        match location {
            QueueLocation::Inbox => Self::Inbox,
            QueueLocation::Processed => Self::Processed,
            QueueLocation::Failed => Self::Failed,
        }
    }
}

/// Handle job subcommands
pub fn execute(ctx: &AppContext, cmd: JobCommands) -> Result<CommandOutput> {
    let queue = JobQueue::new(ctx.layout.clone());
    match cmd {
        JobCommands::Submit { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let job: Job = serde_json::from_str(&content)
                .with_context(|| format!("{} is not a valid job document", file.display()))?;
            queue.ensure_dirs().context("Failed to create queue directories")?;
            let path = queue.submit(&job).context("Failed to submit job")?;
            Ok(CommandOutput::success(json!({
                "job_id": job.id,
                "task_type": job.task_type,
                "path": path,
            })))
        }
        JobCommands::List { location } => {
            let files = queue
                .list(location.into())
                .context("Failed to list queue")?;
            Ok(CommandOutput::success(json!({
                "count": files.len(),
                "files": files,
            })))
        }
        JobCommands::History { job_id } => {
            let history = DispatchLedger::new(ctx.layout.ledger())
                .history(&job_id)
                .context("Failed to read ledger")?;
            Ok(CommandOutput::success(json!({
                "job_id": job_id,
                "entries": history,
            })))
        }
    }
}
