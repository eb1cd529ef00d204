//! Dispatch ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-job dispatch state recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Queued,
    Leased,
    Running,
    Acked,
    Failed,
    Dlq,
    Skipped,
}

impl LedgerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Running => "running",
            Self::Acked => "acked",
            Self::Failed => "failed",
            Self::Dlq => "dlq",
            Self::Skipped => "skipped",
        }
    }

    /// Terminal states feed the circuit breaker and end a job's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acked | Self::Failed | Self::Dlq)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Dlq)
    }
}

impl std::fmt::Display for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the dispatch ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub ts: DateTime<Utc>,
    pub job_id: String,
    pub state: LedgerState,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl LedgerEntry {
    pub fn new(job_id: impl Into<String>, state: LedgerState) -> Self {
        Self {
            ts: Utc::now(),
            job_id: job_id.into(),
            state,
            details: serde_json::Value::Null,
            trace_id: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// One line of the fairness ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairnessEntry {
    pub ts: DateTime<Utc>,
    pub agent_id: String,
    pub job_id: String,
}

impl FairnessEntry {
    pub fn new(agent_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            agent_id: agent_id.into(),
            job_id: job_id.into(),
        }
    }
}
