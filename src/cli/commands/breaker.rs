use anyhow::{Context, Result};
use serde_json::json;

use crate::cli::types::BreakerCommands;
use crate::cli::{AppContext, CommandOutput};
use crate::services::CircuitBreaker;

/// Handle breaker subcommands
pub fn execute(ctx: &AppContext, cmd: BreakerCommands) -> Result<CommandOutput> {
    let breaker = CircuitBreaker::new(&ctx.layout, ctx.config.breaker.clone());
    match cmd {
        BreakerCommands::Status => {
            let status = breaker.peek().context("Failed to read breaker state")?;
            // Reporting an open breaker is still a successful status query.
            Ok(CommandOutput::success(json!({"breaker": status})))
        }
        BreakerCommands::Reset => {
            breaker.reset().context("Failed to reset breaker")?;
            Ok(CommandOutput::success(json!({"breaker": "closed"})))
        }
    }
}
