//! One dispatch cycle: scan, score, gate, lease, execute, finalize.
//!
//! A cycle is driven by an explicit [`DispatchContext`]; nothing about
//! in-flight jobs is kept outside it. Gates run in a fixed order and every
//! denial is audited by [`Governance`] before the job is skipped or failed.
//! Once a lease is acquired it is released on every exit path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::audit_log::{AuditAction, AuditCategory, AuditLevel, AuditLog, AuditRecord};
use super::circuit_breaker::CircuitBreaker;
use super::dispatch_ledger::DispatchLedger;
use super::governance::Governance;
use super::handler_registry::HandlerRegistry;
use super::idempotency::IdempotencyStore;
use super::job_scorer::JobScorer;
use super::lease_manager::LeaseManager;
use crate::domain::errors::{DispatchError, StorageError};
use crate::domain::models::{
    Config, DispatcherConfig, Job, JobLocation, LeaseOutcome, LedgerState, ProfileConfig,
    RenewOutcome,
};
use crate::domain::ports::{HandlerInvocation, HandlerOutput};
use crate::infrastructure::handlers::{credential_values, scoped_environment};
use crate::infrastructure::logging::SecretScrubber;
use crate::infrastructure::storage::{JobQueue, QueuedDocument, StateLayout};

const ACTOR: &str = "dispatcher";

/// Lower bound on the heartbeat period.
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// What happened to one job in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Executed and moved to processed.
    Acked,
    /// Moved to failed.
    Failed,
    /// Left in the inbox (or set aside as a duplicate) for a later cycle.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub trace_id: String,
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// State of one cycle in flight.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub cycle_id: String,
    pub owner: String,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<JobOutcome>,
    halt_reason: Option<String>,
}

impl DispatchContext {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            cycle_id: Uuid::new_v4().to_string(),
            owner: owner.into(),
            started_at: Utc::now(),
            outcomes: Vec::new(),
            halt_reason: None,
        }
    }

    fn halt(&mut self, reason: impl Into<String>) {
        self.halt_reason = Some(reason.into());
    }

    pub fn is_halted(&self) -> bool {
        self.halt_reason.is_some()
    }

    fn push(&mut self, outcome: JobOutcome) {
        self.outcomes.push(outcome);
    }

    fn count(&self, disposition: Disposition) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.disposition == disposition)
            .count()
    }

    pub fn into_report(self) -> CycleReport {
        CycleReport {
            cycle_id: self.cycle_id.clone(),
            owner: self.owner.clone(),
            ok: self.halt_reason.is_none(),
            halted: self.halt_reason.is_some(),
            processed: self.count(Disposition::Acked),
            failed: self.count(Disposition::Failed),
            skipped: self.count(Disposition::Skipped),
            halt_reason: self.halt_reason,
            outcomes: self.outcomes,
        }
    }
}

/// Summary returned by [`JobDispatcher::run_cycle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub owner: String,
    pub ok: bool,
    pub halted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub outcomes: Vec<JobOutcome>,
}

/// Terminal result of one leased attempt.
enum Finish {
    Acked(HandlerOutput),
    Failed { reason: String, details: serde_json::Value },
    Skipped { reason: String, details: serde_json::Value },
    /// Kill switch seen under the governance lock; the cycle stops.
    Halt(String),
}

pub struct JobDispatcher {
    owner: String,
    config: DispatcherConfig,
    profiles: BTreeMap<String, ProfileConfig>,
    queue: JobQueue,
    ledger: DispatchLedger,
    leases: LeaseManager,
    idempotency: IdempotencyStore,
    governance: Governance,
    breaker: CircuitBreaker,
    scorer: JobScorer,
    handlers: HandlerRegistry,
    audit: AuditLog,
}

impl JobDispatcher {
    pub fn new(layout: StateLayout, config: &Config) -> Self {
        let dispatcher = &config.dispatcher;
        Self {
            owner: dispatcher.owner_id(),
            config: dispatcher.clone(),
            profiles: config.profiles.clone(),
            queue: JobQueue::new(layout.clone()),
            ledger: DispatchLedger::new(layout.ledger()),
            leases: LeaseManager::new(layout.leases(), dispatcher.lease_ttl_secs),
            idempotency: IdempotencyStore::new(layout.idempotency(), dispatcher.idempotency_ttl_secs),
            governance: Governance::new(layout.clone(), config.governance.clone()),
            breaker: CircuitBreaker::new(&layout, config.breaker.clone()),
            scorer: JobScorer::from_config(&config.governance),
            handlers: HandlerRegistry::from_config(config),
            audit: AuditLog::new(layout.audit()),
        }
    }

    /// Replace the handler registry, e.g. with in-process handlers.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn ledger(&self) -> &DispatchLedger {
        &self.ledger
    }

    pub fn governance(&self) -> &Governance {
        &self.governance
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    fn heartbeat_period(&self) -> Duration {
        let divisor = u64::from(self.config.heartbeat_divisor.max(1));
        Duration::from_millis(self.config.lease_ttl_secs.saturating_mul(1000) / divisor)
            .max(MIN_HEARTBEAT)
    }

    /// Run one dispatch cycle over the current inbox.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn run_cycle(&self) -> Result<CycleReport, DispatchError> {
        let mut ctx = DispatchContext::new(&self.owner);
        self.queue.ensure_dirs()?;

        let status = self.breaker.begin_cycle(Utc::now())?;
        if status.is_open() {
            warn!(fail_ratio = status.fail_ratio, "circuit open, cycle halted");
            ctx.halt(DispatchError::CircuitOpen { fail_ratio: status.fail_ratio }.to_string());
            return Ok(ctx.into_report());
        }
        if self.governance.kill_switch_engaged() {
            self.audit_kill_switch(None, None)?;
            ctx.halt(DispatchError::KillSwitch.to_string());
            return Ok(ctx.into_report());
        }

        let ordered = self.scorer.order(self.queue.scan()?);
        info!(cycle_id = %ctx.cycle_id, queued = ordered.len(), "dispatch cycle started");

        for scored in ordered.into_iter().take(self.config.max_jobs_per_cycle) {
            let status = self.breaker.evaluate(Utc::now())?;
            if status.is_open() {
                warn!(fail_ratio = status.fail_ratio, "circuit opened mid-cycle, halting");
                ctx.halt(DispatchError::CircuitOpen { fail_ratio: status.fail_ratio }.to_string());
                break;
            }
            if self.governance.kill_switch_engaged() {
                self.audit_kill_switch(Some(scored.document.job_id()), None)?;
                ctx.halt(DispatchError::KillSwitch.to_string());
                break;
            }

            self.process_document(&mut ctx, &scored.document, scored.score).await?;
            if ctx.is_halted() {
                break;
            }
        }

        let report = ctx.into_report();
        info!(
            cycle_id = %report.cycle_id,
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            halted = report.halted,
            "dispatch cycle finished"
        );
        Ok(report)
    }

    async fn process_document(
        &self,
        ctx: &mut DispatchContext,
        doc: &QueuedDocument,
        score: Option<f64>,
    ) -> Result<(), DispatchError> {
        let job = match &doc.parsed {
            Ok(job) => job,
            Err(reason) => {
                self.reject_malformed(ctx, doc, reason)?;
                return Ok(());
            }
        };
        let trace_id = job.trace_id_or_new();
        let outcome = |disposition, reason: Option<String>| JobOutcome {
            job_id: job.id.clone(),
            trace_id: trace_id.clone(),
            disposition,
            score,
            reason,
        };

        if self.idempotency.contains(&job.id, Utc::now())? {
            debug!(job_id = %job.id, trace_id = %trace_id, "duplicate within idempotency window");
            self.ledger.transition(&job.id, LedgerState::Skipped, &trace_id, json!({
                "reason": "duplicate",
            }))?;
            self.queue.move_to(&doc.path, JobLocation::Processed)?;
            ctx.push(outcome(Disposition::Skipped, Some("duplicate".to_string())));
            return Ok(());
        }

        self.ledger.transition(&job.id, LedgerState::Queued, &trace_id, json!({
            "task_type": job.task_type,
            "target_profile": job.target_profile,
            "score": score,
        }))?;

        match self.leases.acquire(&job.id, &self.owner, Utc::now())? {
            LeaseOutcome::Acquired(lease) => {
                self.ledger.transition(&job.id, LedgerState::Leased, &trace_id, json!({
                    "owner": self.owner,
                    "expires_at": lease.expires_at,
                }))?;
            }
            LeaseOutcome::Held { owner, .. } => {
                let err = DispatchError::LeaseConflict {
                    job_id: job.id.clone(),
                    owner: owner.clone(),
                };
                self.ledger.transition(&job.id, LedgerState::Skipped, &trace_id, json!({
                    "reason": "lease_held",
                    "owner": owner,
                }))?;
                ctx.push(outcome(Disposition::Skipped, Some(err.to_string())));
                return Ok(());
            }
        }

        let finish = self.run_leased(job, &doc.path, &trace_id).await;
        let released = self.leases.release(&job.id, &self.owner);
        let finish = finish?;
        released?;

        match finish {
            Finish::Acked(output) => {
                self.queue.move_to(&doc.path, JobLocation::Processed)?;
                self.ledger.transition(&job.id, LedgerState::Acked, &trace_id, self.output_details(job, &output))?;
                self.governance.record_spend(job, &trace_id)?;
                self.governance.register_fairness(job.owning_agent(), &job.id)?;
                self.idempotency.mark(&job.id, Utc::now())?;
                info!(job_id = %job.id, trace_id = %trace_id, "job acked");
                ctx.push(outcome(Disposition::Acked, None));
            }
            Finish::Failed { reason, details } => {
                self.queue.move_to(&doc.path, JobLocation::Failed)?;
                self.ledger.transition(&job.id, LedgerState::Failed, &trace_id, details)?;
                warn!(job_id = %job.id, trace_id = %trace_id, reason = %reason, "job failed");
                ctx.push(outcome(Disposition::Failed, Some(reason)));
            }
            Finish::Skipped { reason, details } => {
                self.ledger.transition(&job.id, LedgerState::Skipped, &trace_id, details)?;
                ctx.push(outcome(Disposition::Skipped, Some(reason)));
            }
            Finish::Halt(reason) => {
                self.ledger.transition(&job.id, LedgerState::Skipped, &trace_id, json!({
                    "reason": "kill_switch",
                }))?;
                ctx.push(outcome(Disposition::Skipped, Some(reason.clone())));
                ctx.halt(reason);
            }
        }
        Ok(())
    }

    /// Gates and execution while the lease is held.
    async fn run_leased(&self, job: &Job, job_path: &Path, trace_id: &str) -> Result<Finish, DispatchError> {
        if let Some(finish) = soft_denial(self.governance.check_fairness(job, trace_id))? {
            return Ok(finish);
        }
        if let Some(finish) = soft_denial(self.governance.check_budget(job, trace_id))? {
            return Ok(finish);
        }

        match self.governance.verify_approval(job, trace_id) {
            Ok(()) => {}
            Err(err) if matches!(err, DispatchError::PolicyDenied { .. }) => {
                return Ok(Finish::Failed {
                    reason: err.to_string(),
                    details: json!({"reason": "approval"}),
                });
            }
            Err(err) => return Err(err),
        }

        match self.governance.authorize_spend(job, trace_id) {
            Err(DispatchError::KillSwitch) => return Ok(Finish::Halt(DispatchError::KillSwitch.to_string())),
            other => {
                if let Some(finish) = soft_denial(other)? {
                    return Ok(finish);
                }
            }
        }

        let Some(handler) = self.handlers.get(&job.task_type) else {
            let err = DispatchError::UnknownTaskType(job.task_type.clone());
            self.record_failure(job, trace_id, AuditAction::UnknownTaskType, &err.to_string(), json!({}))?;
            return Ok(Finish::Failed {
                reason: err.to_string(),
                details: json!({"reason": "unknown_task_type", "task_type": job.task_type}),
            });
        };

        self.ledger.transition(&job.id, LedgerState::Running, trace_id, json!({
            "handler": handler.name(),
        }))?;

        let env = scoped_environment(job, job_path, trace_id, &self.profiles, std::env::vars());
        let invocation = HandlerInvocation {
            job: job.clone(),
            job_path: job_path.to_path_buf(),
            env,
            timeout: self.handlers.timeout_for(&job.task_type),
        };

        let heartbeat = Heartbeat::start(
            self.leases.clone(),
            job.id.clone(),
            self.owner.clone(),
            self.heartbeat_period(),
        );
        let result = handler.execute(&invocation).await;
        let mut lease_lost = heartbeat.stop().await;
        if !lease_lost {
            lease_lost = matches!(
                self.leases.renew(&job.id, &self.owner, Utc::now())?,
                RenewOutcome::Lost { .. }
            );
        }

        let scrubber = SecretScrubber::new().with_values(credential_values(&invocation.env));
        match result {
            _ if lease_lost => {
                let err = DispatchError::LeaseLost { job_id: job.id.clone() };
                self.record_failure(job, trace_id, AuditAction::LeaseLost, &err.to_string(), json!({
                    "owner": self.owner,
                }))?;
                Ok(Finish::Failed {
                    reason: err.to_string(),
                    details: json!({"reason": "lease_lost", "owner": self.owner}),
                })
            }
            Ok(output) if output.success => {
                let output = self.scrub_output(&scrubber, output);
                Ok(Finish::Acked(output))
            }
            Ok(output) => {
                let output = self.scrub_output(&scrubber, output);
                let reason = format!("handler {} exited with {:?}", handler.name(), output.exit_code);
                let details = self.output_details(job, &output);
                self.record_failure(job, trace_id, AuditAction::HandlerFailed, &reason, json!({
                    "exit_code": output.exit_code,
                    "stderr": output.stderr,
                }))?;
                Ok(Finish::Failed { reason, details })
            }
            Err(err) => {
                let reason = scrubber.scrub_message(&err.to_string());
                self.record_failure(job, trace_id, AuditAction::HandlerFailed, &reason, json!({}))?;
                Ok(Finish::Failed {
                    details: json!({"reason": "handler_error", "error": reason}),
                    reason,
                })
            }
        }
    }

    fn scrub_output(&self, scrubber: &SecretScrubber, output: HandlerOutput) -> HandlerOutput {
        let max = self.config.output_capture_bytes;
        HandlerOutput {
            stdout: scrubber.scrub_truncated(&output.stdout, max),
            stderr: scrubber.scrub_truncated(&output.stderr, max),
            ..output
        }
    }

    fn output_details(&self, job: &Job, output: &HandlerOutput) -> serde_json::Value {
        json!({
            "task_type": job.task_type,
            "exit_code": output.exit_code,
            "duration_ms": output.duration_ms,
            "stdout": output.stdout,
            "stderr": output.stderr,
            "owner": self.owner,
        })
    }

    fn reject_malformed(&self, ctx: &mut DispatchContext, doc: &QueuedDocument, reason: &str) -> Result<(), DispatchError> {
        let err = DispatchError::Parse {
            path: doc.path.display().to_string(),
            reason: reason.to_string(),
        };
        self.audit.record(
            &AuditRecord::new(
                AuditLevel::Error,
                AuditCategory::Dispatch,
                AuditAction::ParseError,
                ACTOR,
                err.to_string(),
            )
            .with_job(&doc.file_id),
        )?;
        self.queue.move_to(&doc.path, JobLocation::Failed)?;
        warn!(path = %doc.path.display(), reason, "malformed job document moved to failed");
        ctx.push(JobOutcome {
            job_id: doc.file_id.clone(),
            trace_id: String::new(),
            disposition: Disposition::Failed,
            score: None,
            reason: Some(err.to_string()),
        });
        Ok(())
    }

    fn record_failure(
        &self,
        job: &Job,
        trace_id: &str,
        action: AuditAction,
        message: &str,
        details: serde_json::Value,
    ) -> Result<(), StorageError> {
        let mut record = AuditRecord::new(AuditLevel::Error, AuditCategory::Dispatch, action, ACTOR, message)
            .with_job(&job.id)
            .with_trace(trace_id);
        if let serde_json::Value::Object(map) = details {
            for (key, value) in map {
                record = record.with_detail(key, value);
            }
        }
        self.audit.record(&record)
    }

    fn audit_kill_switch(&self, job_id: Option<&str>, trace_id: Option<&str>) -> Result<(), StorageError> {
        warn!(job_id, "kill switch engaged, cycle halted");
        let mut record = AuditRecord::new(
            AuditLevel::Critical,
            AuditCategory::Governance,
            AuditAction::KillSwitchHalt,
            ACTOR,
            "kill switch engaged, dispatch halted",
        );
        if let Some(job_id) = job_id {
            record = record.with_job(job_id);
        }
        if let Some(trace_id) = trace_id {
            record = record.with_trace(trace_id);
        }
        self.audit.record(&record)
    }
}

/// Map a budget or fairness denial to a skip; pass other errors through.
fn soft_denial(gate: Result<(), DispatchError>) -> Result<Option<Finish>, DispatchError> {
    match gate {
        Ok(()) => Ok(None),
        Err(DispatchError::PolicyDenied { kind, reason }) => {
            let err = DispatchError::PolicyDenied { kind, reason };
            Ok(Some(Finish::Skipped {
                reason: err.to_string(),
                details: json!({"reason": kind.as_str()}),
            }))
        }
        Err(err) => Err(err),
    }
}

/// Background lease renewal for one executing job.
struct Heartbeat {
    lost: Arc<AtomicBool>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(leases: LeaseManager, job_id: String, owner: String, period: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; the lease was just taken.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match leases.renew(&job_id, &owner, Utc::now()) {
                            Ok(RenewOutcome::Renewed(lease)) => {
                                debug!(job_id, expires_at = %lease.expires_at, "lease renewed");
                            }
                            Ok(RenewOutcome::Lost { current_owner }) => {
                                warn!(job_id, ?current_owner, "lease lost during execution");
                                flag.store(true, Ordering::Release);
                                break;
                            }
                            Err(e) => warn!(job_id, error = %e, "lease renewal failed"),
                        }
                    }
                }
            }
        });

        Self {
            lost,
            stop: Some(stop_tx),
            handle,
        }
    }

    /// Stop renewing. Returns whether the lease was observed lost.
    async fn stop(mut self) -> bool {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!(error = %e, "heartbeat task ended abnormally");
        }
        self.lost.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::audit_log::AuditFilter;
    use tempfile::TempDir;

    fn dispatcher(config: Config) -> (TempDir, JobDispatcher) {
        let dir = TempDir::new().unwrap();
        let dispatcher = JobDispatcher::new(StateLayout::new(dir.path()), &config).with_owner("test-owner");
        (dir, dispatcher)
    }

    #[test]
    fn test_heartbeat_period() {
        let mut config = Config::default();
        config.dispatcher.lease_ttl_secs = 90;
        config.dispatcher.heartbeat_divisor = 3;
        let (_dir, d) = dispatcher(config);
        assert_eq!(d.heartbeat_period(), Duration::from_secs(30));
    }

    #[test]
    fn test_context_report_counts() {
        let mut ctx = DispatchContext::new("o");
        for disposition in [Disposition::Acked, Disposition::Skipped, Disposition::Skipped] {
            ctx.push(JobOutcome {
                job_id: "j".to_string(),
                trace_id: "t".to_string(),
                disposition,
                score: None,
                reason: None,
            });
        }
        let report = ctx.into_report();
        assert!(report.ok);
        assert_eq!((report.processed, report.failed, report.skipped), (1, 0, 2));
    }

    #[tokio::test]
    async fn test_empty_inbox_is_ok() {
        let (_dir, d) = dispatcher(Config::default());
        let report = d.run_cycle().await.unwrap();
        assert!(report.ok);
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_kill_switch_halts_before_leasing() {
        let (_dir, d) = dispatcher(Config::default());
        d.queue().submit(&Job::new("k1", "echo", "ops")).unwrap();
        d.governance().engage_kill_switch("maintenance").unwrap();

        let report = d.run_cycle().await.unwrap();
        assert!(report.halted);
        assert!(!report.ok);
        assert!(d.leases().get("k1").unwrap().is_none());
        assert_eq!(d.queue().scan().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_document_moves_to_failed() {
        let (dir, d) = dispatcher(Config::default());
        d.queue().ensure_dirs().unwrap();
        std::fs::write(dir.path().join("queue/inbox/junk.json"), "{nope").unwrap();

        let report = d.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(d.queue().list(JobLocation::Failed).unwrap(), vec!["junk.json"]);

        let audited = d
            .governance()
            .audit()
            .query(&AuditFilter::new().with_action(AuditAction::ParseError))
            .unwrap();
        assert_eq!(audited.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_type_fails() {
        let (_dir, d) = dispatcher(Config::default());
        d.queue().submit(&Job::new("u1", "teleport", "ops")).unwrap();

        let report = d.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(
            d.ledger().states("u1").unwrap(),
            vec![LedgerState::Queued, LedgerState::Leased, LedgerState::Failed]
        );
        assert!(d.leases().get("u1").unwrap().is_none());
    }
}
