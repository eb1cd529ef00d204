//! Supervisor verdicts and round reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Score at or above which a verdict is OK.
pub const OK_THRESHOLD: u32 = 70;
/// Score at or above which a verdict is SUSPECT rather than FAIL.
pub const SUSPECT_THRESHOLD: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictStatus {
    Ok,
    Suspect,
    Fail,
}

impl VerdictStatus {
    pub fn from_score(score: u32) -> Self {
        if score >= OK_THRESHOLD {
            Self::Ok
        } else if score >= SUSPECT_THRESHOLD {
            Self::Suspect
        } else {
            Self::Fail
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Suspect => "SUSPECT",
            Self::Fail => "FAIL",
        }
    }
}

/// A single detector hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub detector: String,
    pub penalty: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

impl Finding {
    pub fn new(detector: impl Into<String>, penalty: u32, message: impl Into<String>) -> Self {
        Self {
            detector: detector.into(),
            penalty,
            message: message.into(),
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        let mut evidence = evidence.into();
        if evidence.len() > 200 {
            let mut cut = 200;
            while !evidence.is_char_boundary(cut) {
                cut -= 1;
            }
            evidence.truncate(cut);
        }
        self.evidence = Some(evidence);
        self
    }
}

/// Verdict for one agent's round output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub agent: String,
    pub score: u32,
    pub status: VerdictStatus,
    pub mistakes: Vec<Finding>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

impl Verdict {
    /// Build a verdict from findings: 100 minus penalties, floored at 0.
    pub fn from_findings(agent: impl Into<String>, mistakes: Vec<Finding>) -> Self {
        let penalty: u32 = mistakes.iter().map(|f| f.penalty).sum();
        let score = 100u32.saturating_sub(penalty);
        Self {
            agent: agent.into(),
            score,
            status: VerdictStatus::from_score(score),
            mistakes,
            metrics: BTreeMap::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == VerdictStatus::Ok
    }
}

/// Agents disagreeing on their ontology acknowledgment value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OntologyConflict {
    pub values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<String>,
}

/// Persisted result of scoring one council round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    pub round_id: String,
    pub scored_at: DateTime<Utc>,
    pub verdicts: Vec<Verdict>,
    pub winner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ontology_conflict: Option<OntologyConflict>,
    #[serde(default)]
    pub posted_messages: Vec<String>,
    /// Agent targeted by a manufactured challenge when every verdict was OK.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_challenge: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bands() {
        assert_eq!(VerdictStatus::from_score(100), VerdictStatus::Ok);
        assert_eq!(VerdictStatus::from_score(70), VerdictStatus::Ok);
        assert_eq!(VerdictStatus::from_score(69), VerdictStatus::Suspect);
        assert_eq!(VerdictStatus::from_score(40), VerdictStatus::Suspect);
        assert_eq!(VerdictStatus::from_score(39), VerdictStatus::Fail);
        assert_eq!(VerdictStatus::from_score(0), VerdictStatus::Fail);
    }

    #[test]
    fn test_score_floors_at_zero() {
        let findings = vec![
            Finding::new("a", 60, "x"),
            Finding::new("b", 60, "y"),
        ];
        let verdict = Verdict::from_findings("agent", findings);
        assert_eq!(verdict.score, 0);
        assert_eq!(verdict.status, VerdictStatus::Fail);
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&VerdictStatus::Suspect).unwrap();
        assert_eq!(json, "\"SUSPECT\"");
    }
}
