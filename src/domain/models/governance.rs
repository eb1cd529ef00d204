use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Approval registry entry, keyed by raw token or salted digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTokenEntry {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Dispatch flows normally.
    #[default]
    Closed,
    /// Dispatch halts until the cooldown elapses.
    Open,
    /// Dispatch proceeds as a probe.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Persisted breaker state. Absence of the file means closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSentinel {
    pub state: CircuitState,
    pub opened_at: DateTime<Utc>,
    pub fail_ratio: f64,
    pub cooldown_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub probes: u32,
}
