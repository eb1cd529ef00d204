//! At-least-once delivery of task envelopes to peer dispatchers.
//!
//! An envelope is written to the outbox before the first attempt and only
//! removed once a peer positively acknowledges it. When retries run out the
//! outbox entry moves to the dead-letter directory together with the last
//! failure reason.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::audit_log::{AuditAction, AuditCategory, AuditLevel, AuditLog, AuditRecord};
use super::dispatch_ledger::DispatchLedger;
use super::idempotency::IdempotencyStore;
use crate::domain::errors::{RouteError, StorageError, TransportError};
use crate::domain::models::{
    AckEnvelope, DeadLetter, DeliveryMode, LedgerEntry, LedgerState, OutboxEntry, RouterConfig,
    TaskEnvelope, ENVELOPE_SCHEMA_VERSION,
};
use crate::domain::ports::PeerTransport;
use crate::infrastructure::storage::json_document::read_json;
use crate::infrastructure::storage::{digest_file_name, JsonDocument, StateLayout};
use crate::infrastructure::transport::transport_for;

const ACTOR: &str = "router";

/// A task to hand to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub receiver: String,
    pub payload: serde_json::Value,
    /// Generated when absent.
    pub task_id: Option<String>,
    pub priority: i32,
    pub mode: DeliveryMode,
}

impl RouteRequest {
    pub fn new(receiver: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            receiver: receiver.into(),
            payload,
            task_id: None,
            priority: 0,
            mode: DeliveryMode::default(),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }
}

/// A positively acknowledged delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub task_id: String,
    pub receiver: String,
    pub attempts: u32,
    pub ack: AckEnvelope,
}

/// Result of redelivering everything left in the outbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: Vec<String>,
    pub dead_lettered: Vec<String>,
}

pub struct TaskRouter {
    config: RouterConfig,
    layout: StateLayout,
    transports: BTreeMap<String, Arc<dyn PeerTransport>>,
    idempotency: IdempotencyStore,
    ledger: DispatchLedger,
    audit: AuditLog,
}

impl std::fmt::Debug for TaskRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRouter")
            .field("sender", &self.config.sender)
            .field("peers", &self.transports.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl TaskRouter {
    /// Build a router with one transport per configured peer.
    pub fn new(layout: StateLayout, config: RouterConfig) -> Result<Self, RouteError> {
        let attempt_timeout = Duration::from_secs(config.attempt_timeout_secs);
        let transports = config
            .peers
            .iter()
            .map(|(name, peer)| Ok((name.clone(), transport_for(peer, attempt_timeout)?)))
            .collect::<Result<BTreeMap<_, _>, TransportError>>()?;

        Ok(Self {
            idempotency: IdempotencyStore::new(layout.router_idempotency(), config.idempotency_ttl_secs),
            ledger: DispatchLedger::new(layout.ledger()),
            audit: AuditLog::new(layout.audit()),
            config,
            layout,
            transports,
        })
    }

    /// Register or replace the transport for a peer.
    pub fn with_transport(mut self, peer: impl Into<String>, transport: Arc<dyn PeerTransport>) -> Self {
        self.transports.insert(peer.into(), transport);
        self
    }

    pub fn peers(&self) -> Vec<String> {
        self.transports.keys().cloned().collect()
    }

    fn outbox_doc(&self, task_id: &str) -> JsonDocument<OutboxEntry> {
        JsonDocument::new(self.layout.outbox_dir().join(digest_file_name(task_id)))
    }

    fn dlq_doc(&self, task_id: &str) -> JsonDocument<DeadLetter> {
        JsonDocument::new(self.layout.dlq_dir().join(digest_file_name(task_id)))
    }

    fn transport(&self, receiver: &str) -> Result<Arc<dyn PeerTransport>, RouteError> {
        self.transports
            .get(receiver)
            .cloned()
            .ok_or_else(|| RouteError::UnknownPeer(receiver.to_string()))
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.config.max_backoff_ms))
            .with_randomization_factor(self.config.jitter.clamp(0.0, 1.0))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Build an envelope, persist it to the outbox and deliver it.
    #[instrument(skip(self, request), fields(receiver = %request.receiver))]
    pub async fn route(&self, request: RouteRequest) -> Result<Delivery, RouteError> {
        self.transport(&request.receiver)?;

        let task_id = request
            .task_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !self.idempotency.check_and_mark(&task_id, Utc::now())? {
            warn!(task_id = %task_id, "duplicate task id, not routing");
            return Err(RouteError::Duplicate(task_id));
        }

        let envelope = TaskEnvelope {
            sender: self.config.sender.clone(),
            receiver: request.receiver,
            payload: request.payload,
            task_id: task_id.clone(),
            schema_version: ENVELOPE_SCHEMA_VERSION.to_string(),
            priority: request.priority,
            mode: request.mode,
            timestamp: Utc::now(),
        };
        let entry = OutboxEntry {
            task_id,
            envelope,
            attempts: 0,
            created_at: Utc::now(),
        };
        self.outbox_doc(&entry.task_id).save(&entry)?;
        self.deliver(entry).await
    }

    /// Retry one outbox entry until it is acknowledged or retries run out.
    async fn deliver(&self, mut entry: OutboxEntry) -> Result<Delivery, RouteError> {
        let transport = self.transport(&entry.envelope.receiver)?;
        let max_attempts = self.config.max_attempts.max(1);
        let attempt_timeout = Duration::from_secs(self.config.attempt_timeout_secs);
        let mut backoff = self.backoff();
        let outbox = self.outbox_doc(&entry.task_id);

        let reason = loop {
            entry.attempts += 1;
            outbox.save(&entry)?;

            let error = match tokio::time::timeout(attempt_timeout, transport.deliver(&entry.envelope)).await {
                Ok(Ok(ack)) if ack.is_positive() => {
                    outbox.remove()?;
                    info!(
                        task_id = %entry.task_id,
                        peer = %transport.describe(),
                        attempts = entry.attempts,
                        ack_status = %ack.ack_status,
                        "delivered"
                    );
                    return Ok(Delivery {
                        task_id: entry.task_id,
                        receiver: entry.envelope.receiver,
                        attempts: entry.attempts,
                        ack,
                    });
                }
                Ok(Ok(ack)) => TransportError::NotAcknowledged(ack.ack_status),
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout(self.config.attempt_timeout_secs),
            };
            warn!(
                task_id = %entry.task_id,
                attempt = entry.attempts,
                max_attempts,
                error = %error,
                "delivery attempt failed"
            );

            if entry.attempts >= max_attempts {
                break error.to_string();
            }
            match backoff.next_backoff() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => break error.to_string(),
            }
        };

        let attempts = entry.attempts;
        let task_id = entry.task_id.clone();
        self.dead_letter(entry, &reason)?;
        Err(RouteError::DeliveryExhausted {
            task_id,
            attempts,
            reason,
        })
    }

    fn dead_letter(&self, entry: OutboxEntry, reason: &str) -> Result<(), RouteError> {
        let letter = DeadLetter {
            task_id: entry.task_id.clone(),
            attempts: entry.attempts,
            reason: reason.to_string(),
            failed_at: Utc::now(),
            envelope: entry.envelope,
        };
        self.audit.record(
            &AuditRecord::new(
                AuditLevel::Error,
                AuditCategory::Router,
                AuditAction::DeadLettered,
                ACTOR,
                format!("delivery to {} exhausted: {reason}", letter.envelope.receiver),
            )
            .with_job(&letter.task_id)
            .with_trace(&letter.task_id)
            .with_detail("attempts", json!(letter.attempts))
            .with_detail("receiver", json!(letter.envelope.receiver)),
        )?;
        self.dlq_doc(&letter.task_id).save(&letter)?;
        self.outbox_doc(&letter.task_id).remove()?;
        self.ledger.append(
            &LedgerEntry::new(&letter.task_id, LedgerState::Dlq)
                .with_details(json!({"receiver": letter.envelope.receiver, "reason": reason, "attempts": letter.attempts}))
                .with_trace(&letter.task_id),
        )?;
        warn!(task_id = %letter.task_id, reason, "moved to dead-letter queue");
        Ok(())
    }

    /// Entries waiting in the outbox, oldest first.
    pub fn outbox(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        let mut entries: Vec<OutboxEntry> = read_entries(&self.layout.outbox_dir())?;
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        Ok(entries)
    }

    /// Entries whose delivery was exhausted, oldest failure first.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        let mut letters: Vec<DeadLetter> = read_entries(&self.layout.dlq_dir())?;
        letters.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.task_id.cmp(&b.task_id)));
        Ok(letters)
    }

    /// Redeliver entries left in the outbox, e.g. by a crashed run.
    #[instrument(skip(self))]
    pub async fn flush_outbox(&self) -> Result<FlushReport, RouteError> {
        let mut report = FlushReport::default();
        for entry in self.outbox()? {
            let task_id = entry.task_id.clone();
            if self.transport(&entry.envelope.receiver).is_err() {
                let reason = format!("unknown peer {}", entry.envelope.receiver);
                self.dead_letter(entry, &reason)?;
                report.dead_lettered.push(task_id);
                continue;
            }
            match self.deliver(entry).await {
                Ok(_) => report.delivered.push(task_id),
                Err(RouteError::DeliveryExhausted { .. }) => report.dead_lettered.push(task_id),
                Err(e) => return Err(e),
            }
        }
        info!(
            delivered = report.delivered.len(),
            dead_lettered = report.dead_lettered.len(),
            "outbox flushed"
        );
        Ok(report)
    }

    /// Move a dead letter back into the outbox with a fresh attempt count.
    pub fn requeue_dead_letter(&self, task_id: &str) -> Result<OutboxEntry, RouteError> {
        let dlq = self.dlq_doc(task_id);
        let letter = dlq
            .load()?
            .ok_or_else(|| RouteError::DeadLetterNotFound(task_id.to_string()))?;

        let entry = OutboxEntry {
            task_id: letter.task_id.clone(),
            envelope: letter.envelope,
            attempts: 0,
            created_at: Utc::now(),
        };
        self.outbox_doc(task_id).save(&entry)?;
        dlq.remove()?;
        self.audit.record(
            &AuditRecord::new(
                AuditLevel::Info,
                AuditCategory::Router,
                AuditAction::DeadLetterRequeued,
                ACTOR,
                "dead letter moved back to the outbox",
            )
            .with_job(task_id)
            .with_detail("previous_reason", json!(letter.reason)),
        )?;
        info!(task_id, "dead letter requeued");
        Ok(entry)
    }
}

fn read_entries<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StorageError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::io(dir, e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let path: PathBuf = entry.map_err(|e| StorageError::io(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json::<T>(&path) {
            Ok(Some(value)) => out.push(value),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable entry"),
        }
    }
    Ok(out)
}
