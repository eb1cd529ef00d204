use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use crate::cli::{AppContext, CommandOutput};
use crate::services::JobDispatcher;

/// Handle the dispatch command
pub async fn execute(ctx: &AppContext, cycles: u32, owner: Option<String>) -> Result<CommandOutput> {
    let mut dispatcher = JobDispatcher::new(ctx.layout.clone(), &ctx.config);
    if let Some(owner) = owner {
        dispatcher = dispatcher.with_owner(owner);
    }

    let mut reports = Vec::new();
    for cycle in 1..=cycles.max(1) {
        let report = dispatcher
            .run_cycle()
            .await
            .with_context(|| format!("Dispatch cycle {cycle} failed"))?;
        let halted = report.halted;
        reports.push(report);
        if halted {
            info!(cycle, "cycle halted, not starting further cycles");
            break;
        }
    }

    let halt_reason = reports.iter().find_map(|r| r.halt_reason.clone());
    let body = json!({
        "owner": dispatcher.owner(),
        "processed": reports.iter().map(|r| r.processed).sum::<usize>(),
        "failed": reports.iter().map(|r| r.failed).sum::<usize>(),
        "skipped": reports.iter().map(|r| r.skipped).sum::<usize>(),
        "halted": halt_reason.is_some(),
        "halt_reason": halt_reason,
        "cycles": reports,
    });
    Ok(CommandOutput::new(reports.iter().all(|r| r.ok), body))
}
