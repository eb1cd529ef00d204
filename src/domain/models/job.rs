//! Job documents consumed from the inbox queue.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk tier declared by the job producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Auction inputs attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobPolicy {
    #[serde(default)]
    pub risk: RiskTier,
    #[serde(default)]
    pub estimated_spend_usd: f64,
    #[serde(default)]
    pub bid: f64,
}

/// A unit of work dropped into the inbox by an external producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub task_type: String,
    pub target_profile: String,
    #[serde(default)]
    pub policy: JobPolicy,
    #[serde(default)]
    pub requires_human_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<String>,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Job {
    /// Create a job with default policy and empty inputs.
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        target_profile: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            target_profile: target_profile.into(),
            policy: JobPolicy::default(),
            requires_human_approval: false,
            approval_token: None,
            inputs: serde_json::Value::Null,
            trace_id: None,
        }
    }

    pub fn with_spend(mut self, estimated_spend_usd: f64) -> Self {
        self.policy.estimated_spend_usd = estimated_spend_usd;
        self
    }

    pub fn with_bid(mut self, bid: f64) -> Self {
        self.policy.bid = bid;
        self
    }

    pub fn with_risk(mut self, risk: RiskTier) -> Self {
        self.policy.risk = risk;
        self
    }

    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn requiring_approval(mut self, token: Option<String>) -> Self {
        self.requires_human_approval = true;
        self.approval_token = token;
        self
    }

    /// The agent a job is attributed to for fairness and per-agent budget.
    pub fn owning_agent(&self) -> &str {
        &self.target_profile
    }

    /// Trace id carried by the document, or a fresh one.
    pub fn trace_id_or_new(&self) -> String {
        self.trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Decode `inputs` into the variant for this job's task type.
    ///
    /// Unknown task types, and known ones whose inputs do not match the
    /// expected shape, fall back to [`JobPayload::Generic`].
    pub fn payload(&self) -> JobPayload {
        let typed = match self.task_type.as_str() {
            "echo" if self.inputs.is_null() => Some(JobPayload::Echo(EchoInputs::default())),
            "echo" => serde_json::from_value::<EchoInputs>(self.inputs.clone())
                .ok()
                .map(JobPayload::Echo),
            "content_generation" => serde_json::from_value(self.inputs.clone())
                .ok()
                .map(JobPayload::ContentGeneration),
            "market_scan" => serde_json::from_value(self.inputs.clone())
                .ok()
                .map(JobPayload::MarketScan),
            "screen_capture" => serde_json::from_value(self.inputs.clone())
                .ok()
                .map(JobPayload::ScreenCapture),
            _ => None,
        };

        typed.unwrap_or_else(|| JobPayload::Generic {
            task_type: self.task_type.clone(),
            inputs: self.inputs.clone(),
        })
    }
}

/// Inputs for the built-in echo task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EchoInputs {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentGenerationInputs {
    pub topic: String,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketScanInputs {
    pub symbols: Vec<String>,
    #[serde(default)]
    pub lookback_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenCaptureInputs {
    pub target: String,
}

/// Typed view over a job's inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Echo(EchoInputs),
    ContentGeneration(ContentGenerationInputs),
    MarketScan(MarketScanInputs),
    ScreenCapture(ScreenCaptureInputs),
    /// Forward-compatible fallback for task types this build does not know.
    Generic {
        task_type: String,
        inputs: serde_json::Value,
    },
}

/// Terminal location of a job document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLocation {
    Inbox,
    Processed,
    Failed,
}

impl JobLocation {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_document() {
        let doc = json!({
            "id": "job-1",
            "task_type": "echo",
            "target_profile": "research",
            "policy": {"risk": "high", "estimated_spend_usd": 1.5, "bid": 20.0},
            "requires_human_approval": true,
            "approval_token": "tok",
            "inputs": {"message": "hi"}
        });

        let job: Job = serde_json::from_value(doc).unwrap();
        assert_eq!(job.policy.risk, RiskTier::High);
        assert!(job.requires_human_approval);
        assert_eq!(job.approval_token.as_deref(), Some("tok"));
        assert_eq!(
            job.payload(),
            JobPayload::Echo(EchoInputs {
                message: Some("hi".to_string())
            })
        );
    }

    #[test]
    fn test_missing_policy_defaults() {
        let job: Job = serde_json::from_value(json!({
            "id": "job-2",
            "task_type": "echo",
            "target_profile": "ops"
        }))
        .unwrap();

        assert_eq!(job.policy, JobPolicy::default());
        assert!(!job.requires_human_approval);
        assert_eq!(job.owning_agent(), "ops");
    }

    #[test]
    fn test_unknown_task_type_is_generic() {
        let job = Job::new("j", "quantum_thing", "lab").with_inputs(json!({"x": 1}));
        match job.payload() {
            JobPayload::Generic { task_type, inputs } => {
                assert_eq!(task_type, "quantum_thing");
                assert_eq!(inputs["x"], 1);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_inputs_fall_back() {
        let job = Job::new("j", "market_scan", "trading").with_inputs(json!({"wrong": true}));
        assert!(matches!(job.payload(), JobPayload::Generic { .. }));
    }
}
