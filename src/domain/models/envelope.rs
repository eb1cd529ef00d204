//! Task envelopes exchanged between dispatcher instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope schema version stamped on every outbound task.
pub const ENVELOPE_SCHEMA_VERSION: &str = "1.0";
/// Ack contract version this build understands.
pub const ACK_CONTRACT_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub sender: String,
    pub receiver: String,
    pub payload: serde_json::Value,
    pub task_id: String,
    pub schema_version: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub mode: DeliveryMode,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEnvelope {
    #[serde(default)]
    pub ack_contract_version: String,
    pub ack_status: String,
    #[serde(default)]
    pub ack_observed: bool,
}

impl AckEnvelope {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            ack_contract_version: ACK_CONTRACT_VERSION.to_string(),
            ack_status: status.into(),
            ack_observed: true,
        }
    }

    /// Only an explicit positive state counts as delivery.
    pub fn is_positive(&self) -> bool {
        matches!(
            self.ack_status.to_lowercase().as_str(),
            "accepted" | "received" | "queued"
        )
    }
}

/// Envelope persisted before delivery is attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub task_id: String,
    pub envelope: TaskEnvelope,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Envelope whose retries were exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task_id: String,
    pub envelope: TaskEnvelope,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_ack_states() {
        for status in ["accepted", "RECEIVED", "queued"] {
            assert!(AckEnvelope::new(status).is_positive(), "{status}");
        }
        for status in ["rejected", "", "ok", "error"] {
            assert!(!AckEnvelope::new(status).is_positive(), "{status}");
        }
    }

    #[test]
    fn test_ack_parses_with_missing_fields() {
        let ack: AckEnvelope = serde_json::from_str(r#"{"ack_status": "accepted"}"#).unwrap();
        assert!(ack.is_positive());
        assert!(!ack.ack_observed);
    }
}
