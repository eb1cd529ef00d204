//! Audit log for governance decisions and failures.
//!
//! Records are appended to `audit.jsonl` before the side effects they
//! describe (a denial is audited before the job is skipped or failed), so
//! the trail survives a crash between the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

use crate::domain::errors::StorageError;
use crate::infrastructure::storage::JsonlLog;

/// Audit log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// General information about operations.
    Info,
    /// Gate decisions (allow or deny).
    Decision,
    /// Warning conditions.
    Warning,
    /// Error conditions.
    Error,
    /// Critical issues requiring attention.
    Critical,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Decision => "decision",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// Category of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Dispatch,
    Governance,
    Breaker,
    Council,
    Patch,
    Router,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Governance => "governance",
            Self::Breaker => "breaker",
            Self::Council => "council",
            Self::Patch => "patch",
            Self::Router => "router",
        }
    }
}

/// Type of decision or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Dispatch
    ParseError,
    UnknownTaskType,
    HandlerFailed,
    LeaseLost,
    KillSwitchHalt,

    // Governance gates
    BudgetDenied,
    FairnessDenied,
    ApprovalDenied,
    SpendAuthorized,
    SpendRecorded,

    // Breaker
    CircuitOpened,
    CircuitHalfOpened,
    CircuitClosed,

    // Council
    OntologyConflict,
    PatchApplied,
    PatchRejected,
    PatchRolledBack,
    PatchRollbackFailed,

    // Router
    DeadLettered,
    DeadLetterRequeued,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "parse_error",
            Self::UnknownTaskType => "unknown_task_type",
            Self::HandlerFailed => "handler_failed",
            Self::LeaseLost => "lease_lost",
            Self::KillSwitchHalt => "kill_switch_halt",
            Self::BudgetDenied => "budget_denied",
            Self::FairnessDenied => "fairness_denied",
            Self::ApprovalDenied => "approval_denied",
            Self::SpendAuthorized => "spend_authorized",
            Self::SpendRecorded => "spend_recorded",
            Self::CircuitOpened => "circuit_opened",
            Self::CircuitHalfOpened => "circuit_half_opened",
            Self::CircuitClosed => "circuit_closed",
            Self::OntologyConflict => "ontology_conflict",
            Self::PatchApplied => "patch_applied",
            Self::PatchRejected => "patch_rejected",
            Self::PatchRolledBack => "patch_rolled_back",
            Self::PatchRollbackFailed => "patch_rollback_failed",
            Self::DeadLettered => "dead_lettered",
            Self::DeadLetterRequeued => "dead_letter_requeued",
        }
    }
}

/// A single audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub level: AuditLevel,
    pub category: AuditCategory,
    pub action: AuditAction,
    /// Component or owner that made the decision.
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl AuditRecord {
    pub fn new(
        level: AuditLevel,
        category: AuditCategory,
        action: AuditAction,
        actor: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            level,
            category,
            action,
            actor: actor.into(),
            job_id: None,
            message: message.into(),
            details: BTreeMap::new(),
            trace_id: None,
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Filter for querying audit logs.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub min_level: Option<AuditLevel>,
    pub category: Option<AuditCategory>,
    pub action: Option<AuditAction>,
    pub job_id: Option<String>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_level(mut self, level: AuditLevel) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn with_category(mut self, category: AuditCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check if an entry matches this filter.
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(min_level) = self.min_level {
            if record.level < min_level {
                return false;
            }
        }
        if let Some(category) = self.category {
            if record.category != category {
                return false;
            }
        }
        if let Some(action) = self.action {
            if record.action != action {
                return false;
            }
        }
        if let Some(ref job_id) = self.job_id {
            if record.job_id.as_deref() != Some(job_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Append-only audit trail.
#[derive(Debug, Clone)]
pub struct AuditLog {
    log: JsonlLog<AuditRecord>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            log: JsonlLog::new(path),
        }
    }

    /// Persist a record and mirror it to tracing.
    pub fn record(&self, record: &AuditRecord) -> Result<(), StorageError> {
        self.log.append(record)?;
        info!(
            level = record.level.as_str(),
            category = record.category.as_str(),
            action = record.action.as_str(),
            actor = %record.actor,
            job_id = ?record.job_id,
            trace_id = ?record.trace_id,
            "audit: {}",
            record.message
        );
        Ok(())
    }

    /// Matching records, newest last. `limit` keeps the most recent ones.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, StorageError> {
        let mut matching: Vec<AuditRecord> = self
            .log
            .read_all()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matching.len().saturating_sub(limit);
            matching.drain(..skip);
        }
        Ok(matching)
    }
}
