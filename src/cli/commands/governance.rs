use anyhow::{Context, Result};
use serde_json::json;

use crate::cli::types::GovernanceCommands;
use crate::cli::{AppContext, CommandOutput};
use crate::services::Governance;

/// Handle governance subcommands
pub fn execute(ctx: &AppContext, cmd: GovernanceCommands) -> Result<CommandOutput> {
    let governance = Governance::new(ctx.layout.clone(), ctx.config.governance.clone());
    match cmd {
        GovernanceCommands::Budget { agent } => {
            let snapshot = governance.budgets(&agent).context("Failed to read budgets")?;
            let share = governance
                .fairness_share(&agent)
                .context("Failed to read fairness ledger")?;
            Ok(CommandOutput::success(json!({
                "agent": agent,
                "global": snapshot.global,
                "agent_budget": snapshot.agent,
                "fairness_share": share.share,
                "fairness_samples": share.samples,
                "kill_switch": governance.kill_switch_engaged(),
            })))
        }
        GovernanceCommands::Approve { token, note } => {
            let digest = governance
                .register_approval(&token, note)
                .context("Failed to register approval token")?;
            Ok(CommandOutput::success(json!({"digest": digest})))
        }
        GovernanceCommands::Halt { reason } => {
            governance
                .engage_kill_switch(&reason)
                .context("Failed to engage kill switch")?;
            Ok(CommandOutput::success(json!({"kill_switch": true, "reason": reason})))
        }
        GovernanceCommands::Resume => {
            governance
                .release_kill_switch()
                .context("Failed to release kill switch")?;
            Ok(CommandOutput::success(json!({"kill_switch": false})))
        }
    }
}
