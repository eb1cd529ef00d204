use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::json;

use crate::cli::types::BusCommands;
use crate::cli::{AppContext, CommandOutput};
use crate::domain::errors::BusError;
use crate::domain::models::{duration_from_secs, Intent, VoteDecision};
use crate::services::{CouncilBus, Outgoing};

/// Handle bus subcommands
pub fn execute(ctx: &AppContext, cmd: BusCommands) -> Result<CommandOutput> {
    let bus = CouncilBus::new(&ctx.layout, ctx.config.council.message_ttl_secs);
    let result = match cmd {
        BusCommands::Send {
            from,
            to,
            intent,
            payload,
            ttl,
        } => {
            let intent: Intent = intent.parse().map_err(anyhow::Error::msg)?;
            if intent.is_control() {
                return Err(anyhow!("use `bus claim` or `bus ack` for {intent:?} messages"));
            }
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let mut outgoing = Outgoing::new(from, to, intent, payload);
            if let Some(secs) = ttl {
                outgoing = outgoing.with_ttl(duration_from_secs(secs));
            }
            bus.send(outgoing).map(|m| json!({"message": m}))
        }
        BusCommands::Recv { agent } => bus
            .recv(&agent, Utc::now())
            .map(|messages| json!({"agent": agent, "count": messages.len(), "messages": messages})),
        BusCommands::Claim { message_id, agent } => bus.claim(&message_id, &agent).map(|m| json!({"claim": m})),
        BusCommands::Ack { message_id, agent } => bus.ack(&message_id, &agent).map(|m| json!({"ack": m})),
        BusCommands::Propose {
            title,
            proposer,
            quorum,
        } => bus
            .propose(&title, &proposer, quorum.unwrap_or(ctx.config.council.quorum))
            .map(|p| json!({"proposal": p})),
        BusCommands::Vote {
            proposal_id,
            agent,
            decision,
        } => {
            let decision: VoteDecision = decision.parse().map_err(anyhow::Error::msg)?;
            bus.vote(&proposal_id, &agent, decision)
                .map(|p| json!({"proposal": p}))
        }
        BusCommands::History => bus
            .history()
            .map(|messages| json!({"count": messages.len(), "messages": messages})),
    };

    match result {
        Ok(body) => Ok(CommandOutput::success(body)),
        Err(BusError::Storage(e)) => Err(e).context("Bus operation failed"),
        // Conflicts with bus state are refusals, not operational errors.
        Err(e) => Ok(CommandOutput::denied(json!({"error": e.to_string()}))),
    }
}
