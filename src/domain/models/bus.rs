//! Council bus records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Address that reaches every agent.
pub const BROADCAST: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Verify,
    Challenge,
    Claim,
    Ack,
    Proposal,
    Vote,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Challenge => "challenge",
            Self::Claim => "claim",
            Self::Ack => "ack",
            Self::Proposal => "proposal",
            Self::Vote => "vote",
        }
    }

    /// Claim and ack records reference other messages and are never delivered.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Claim | Self::Ack)
    }
}

impl std::str::FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "verify" => Ok(Self::Verify),
            "challenge" => Ok(Self::Challenge),
            "claim" => Ok(Self::Claim),
            "ack" => Ok(Self::Ack),
            "proposal" => Ok(Self::Proposal),
            "vote" => Ok(Self::Vote),
            other => Err(format!("unknown intent: {other}")),
        }
    }
}

/// One line of the bus log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub from: String,
    pub to: String,
    pub intent: Intent,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Message referenced by a claim or ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
}

impl BusMessage {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_addressed_to(&self, agent: &str) -> bool {
        self.to == agent || self.to == BROADCAST
    }
}

/// Status derived by scanning the log for later claim/ack records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Open,
    Claimed,
    Acked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
}

impl std::str::FromStr for VoteDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" | "yes" => Ok(Self::Approve),
            "reject" | "no" => Ok(Self::Reject),
            other => Err(format!("unknown vote decision: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Voting,
    ResolvedApproved,
    ResolvedRejected,
}

impl ProposalStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::ResolvedApproved | Self::ResolvedRejected)
    }
}

/// Mutable decision record kept beside the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub title: String,
    pub proposer: String,
    #[serde(default)]
    pub votes: BTreeMap<String, VoteDecision>,
    pub quorum: usize,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Proposal {
    pub fn count(&self, decision: VoteDecision) -> usize {
        self.votes.values().filter(|d| **d == decision).count()
    }

    /// Record a vote and resolve when either side reaches quorum.
    pub fn apply_vote(&mut self, agent: impl Into<String>, decision: VoteDecision) {
        self.votes.insert(agent.into(), decision);
        self.status = if self.count(VoteDecision::Approve) >= self.quorum {
            ProposalStatus::ResolvedApproved
        } else if self.count(VoteDecision::Reject) >= self.quorum {
            ProposalStatus::ResolvedRejected
        } else {
            ProposalStatus::Voting
        };
        if self.status.is_resolved() {
            self.resolved_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(quorum: usize) -> Proposal {
        Proposal {
            id: "p1".to_string(),
            title: "t".to_string(),
            proposer: "alpha".to_string(),
            votes: BTreeMap::new(),
            quorum,
            status: ProposalStatus::Proposed,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_last_vote_wins() {
        let mut p = proposal(2);
        p.apply_vote("a", VoteDecision::Approve);
        p.apply_vote("a", VoteDecision::Reject);
        assert_eq!(p.count(VoteDecision::Approve), 0);
        assert_eq!(p.count(VoteDecision::Reject), 1);
        assert_eq!(p.status, ProposalStatus::Voting);
    }

    #[test]
    fn test_reject_quorum_resolves() {
        let mut p = proposal(2);
        p.apply_vote("a", VoteDecision::Reject);
        p.apply_vote("b", VoteDecision::Reject);
        assert_eq!(p.status, ProposalStatus::ResolvedRejected);
        assert!(p.resolved_at.is_some());
    }

    #[test]
    fn test_intent_round_trip_from_str() {
        assert_eq!("Challenge".parse::<Intent>().unwrap(), Intent::Challenge);
        assert!("shout".parse::<Intent>().is_err());
        assert!(Intent::Ack.is_control());
        assert!(!Intent::Verify.is_control());
    }
}
