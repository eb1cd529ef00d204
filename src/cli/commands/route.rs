use anyhow::{Context, Result};
use serde_json::json;

use crate::cli::types::{RouteCommands, RouteMode};
use crate::cli::{AppContext, CommandOutput};
use crate::domain::errors::RouteError;
use crate::domain::models::DeliveryMode;
use crate::services::{RouteRequest, TaskRouter};

impl From<RouteMode> for DeliveryMode {
    fn from(mode: RouteMode) -> Self {
        match mode {
            RouteMode::Local => Self::Local,
            RouteMode::Remote => Self::Remote,
        }
    }
}

/// Handle route subcommands
pub async fn execute(ctx: &AppContext, cmd: RouteCommands) -> Result<CommandOutput> {
    let router = TaskRouter::new(ctx.layout.clone(), ctx.config.router.clone())
        .context("Failed to build peer transports")?;

    match cmd {
        RouteCommands::Send {
            receiver,
            payload,
            task_id,
            priority,
            mode,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let mut request = RouteRequest::new(receiver, payload)
                .with_priority(priority)
                .with_mode(mode.into());
            if let Some(task_id) = task_id {
                request = request.with_task_id(task_id);
            }

            match router.route(request).await {
                Ok(delivery) => Ok(CommandOutput::success(json!({
                    "task_id": delivery.task_id,
                    "receiver": delivery.receiver,
                    "attempts": delivery.attempts,
                    "ack": delivery.ack,
                }))),
                Err(
                    e @ (RouteError::Duplicate(_)
                    | RouteError::UnknownPeer(_)
                    | RouteError::DeliveryExhausted { .. }),
                ) => Ok(CommandOutput::denied(json!({"error": e.to_string()}))),
                Err(e) => Err(e).context("Routing failed"),
            }
        }
        RouteCommands::Flush => {
            let report = router.flush_outbox().await.context("Failed to flush outbox")?;
            Ok(CommandOutput::new(
                report.dead_lettered.is_empty(),
                json!({
                    "delivered": report.delivered,
                    "dead_lettered": report.dead_lettered,
                }),
            ))
        }
        RouteCommands::Requeue { task_id } => match router.requeue_dead_letter(&task_id) {
            Ok(entry) => Ok(CommandOutput::success(json!({"requeued": entry}))),
            Err(e @ RouteError::DeadLetterNotFound(_)) => {
                Ok(CommandOutput::denied(json!({"error": e.to_string()})))
            }
            Err(e) => Err(e).context("Failed to requeue dead letter"),
        },
        RouteCommands::Dlq => {
            let letters = router.dead_letters().context("Failed to read dead letters")?;
            Ok(CommandOutput::success(json!({
                "count": letters.len(),
                "dead_letters": letters,
            })))
        }
    }
}
