use anyhow::{Context, Result};
use serde_json::json;

use crate::cli::types::CouncilCommands;
use crate::cli::{AppContext, CommandOutput};
use crate::domain::errors::{CouncilError, PatchError};
use crate::services::{CouncilBus, CouncilSupervisor, PatchApplier, ReflectionLearner};

/// Handle council subcommands
pub async fn execute(ctx: &AppContext, cmd: CouncilCommands) -> Result<CommandOutput> {
    match cmd {
        CouncilCommands::Score { round_id } => score(ctx, &round_id),
        CouncilCommands::Apply { round_id, verify } => apply(ctx, &round_id, verify).await,
        CouncilCommands::Reflect => {
            let bus = CouncilBus::new(&ctx.layout, ctx.config.council.message_ttl_secs);
            let guidance = ReflectionLearner::new(&ctx.layout, bus, ctx.config.reflection.clone())
                .reflect()
                .context("Reflection failed")?;
            Ok(CommandOutput::success(guidance))
        }
    }
}

fn score(ctx: &AppContext, round_id: &str) -> Result<CommandOutput> {
    let supervisor = CouncilSupervisor::new(
        ctx.layout.clone(),
        ctx.config.council.clone(),
        ctx.config.paths.repo_root.clone(),
    );
    match supervisor.score_round(round_id) {
        // A round nobody passed has no winner to apply.
        Ok(report) => Ok(CommandOutput::new(report.winner.is_some(), report)),
        Err(CouncilError::NoOutputs(round)) => Ok(CommandOutput::denied(json!({
            "round_id": round,
            "error": "round has no agent outputs",
        }))),
        Err(e) => Err(e).context("Failed to score round"),
    }
}

async fn apply(ctx: &AppContext, round_id: &str, verify: bool) -> Result<CommandOutput> {
    let applier = PatchApplier::new(
        ctx.layout.clone(),
        ctx.config.patch.clone(),
        ctx.config.paths.repo_root.clone(),
    );
    match applier.apply_round(round_id, verify).await {
        Ok(result) => {
            let applied = result.receipt.applied_count();
            let total = result.receipt.blocks.len();
            let rollback_failed = result.receipt.rollback_failed();
            let ok = !rollback_failed && (result.skipped || total == 0 || applied > 0);
            Ok(CommandOutput::new(
                ok,
                json!({
                    "round_id": round_id,
                    "skipped": result.skipped,
                    "applied": applied,
                    "total": total,
                    "rollback_failed": rollback_failed,
                    "receipt": result.receipt,
                }),
            ))
        }
        Err(e @ (PatchError::ReportMissing(_) | PatchError::NoWinner(_))) => Ok(CommandOutput::denied(json!({
            "round_id": round_id,
            "error": e.to_string(),
        }))),
        Err(e) => Err(e).context("Failed to apply round"),
    }
}
