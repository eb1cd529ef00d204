//! Append-only council bus with claim/ack and quorum voting.
//!
//! Messages are never rewritten. A message's status is derived by scanning
//! for later claim and ack records that reference it, and an ack always
//! dominates a claim. Proposals are the one mutable structure and live in
//! their own locked document; every proposal and vote is also appended to the
//! log so the history replays completely.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::errors::BusError;
use crate::domain::models::{
    duration_from_secs, BusMessage, Intent, MessageStatus, Proposal, ProposalStatus, VoteDecision,
    BROADCAST,
};
use crate::infrastructure::storage::{JsonDocument, JsonlLog, StateLayout};

type ProposalTable = BTreeMap<String, Proposal>;

/// A message to be posted.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub from: String,
    pub to: String,
    pub intent: Intent,
    pub payload: serde_json::Value,
    pub ttl: Option<Duration>,
    pub trace_id: Option<String>,
}

impl Outgoing {
    pub fn new(from: impl Into<String>, to: impl Into<String>, intent: Intent, payload: serde_json::Value) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            intent,
            payload,
            ttl: None,
            trace_id: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CouncilBus {
    log: JsonlLog<BusMessage>,
    proposals: JsonDocument<ProposalTable>,
    default_ttl: Duration,
}

impl CouncilBus {
    pub fn new(layout: &StateLayout, message_ttl_secs: u64) -> Self {
        Self {
            log: JsonlLog::new(layout.bus()),
            proposals: JsonDocument::new(layout.proposals()),
            default_ttl: duration_from_secs(message_ttl_secs),
        }
    }

    fn build(&self, outgoing: Outgoing, ref_id: Option<String>, now: DateTime<Utc>) -> BusMessage {
        BusMessage {
            id: Uuid::new_v4().to_string(),
            ts: now,
            from: outgoing.from,
            to: outgoing.to,
            intent: outgoing.intent,
            expires_at: now + outgoing.ttl.unwrap_or(self.default_ttl),
            payload: outgoing.payload,
            trace_id: outgoing.trace_id,
            ref_id,
        }
    }

    /// Post a message. Its derived status starts `open`.
    pub fn send(&self, outgoing: Outgoing) -> Result<BusMessage, BusError> {
        let message = self.build(outgoing, None, Utc::now());
        self.log.append(&message)?;
        debug!(
            id = %message.id,
            from = %message.from,
            to = %message.to,
            intent = message.intent.as_str(),
            "bus message sent"
        );
        Ok(message)
    }

    /// Replay the whole log in append order.
    pub fn history(&self) -> Result<Vec<BusMessage>, BusError> {
        Ok(self.log.read_all()?)
    }

    fn derive_status(messages: &[BusMessage], id: &str) -> Option<MessageStatus> {
        if !messages.iter().any(|m| m.id == id) {
            return None;
        }
        let mut status = MessageStatus::Open;
        for m in messages.iter().filter(|m| m.ref_id.as_deref() == Some(id)) {
            match m.intent {
                Intent::Ack => return Some(MessageStatus::Acked),
                Intent::Claim => status = MessageStatus::Claimed,
                _ => {}
            }
        }
        Some(status)
    }

    pub fn status(&self, id: &str) -> Result<MessageStatus, BusError> {
        let messages = self.history()?;
        Self::derive_status(&messages, id).ok_or_else(|| BusError::MessageNotFound(id.to_string()))
    }

    /// Unexpired, unacked messages addressed to `agent` or broadcast.
    pub fn recv(&self, agent: &str, now: DateTime<Utc>) -> Result<Vec<BusMessage>, BusError> {
        let messages = self.history()?;
        let mut acked: Vec<&str> = Vec::new();
        for m in &messages {
            if m.intent == Intent::Ack {
                if let Some(ref_id) = m.ref_id.as_deref() {
                    acked.push(ref_id);
                }
            }
        }
        Ok(messages
            .iter()
            .filter(|m| !m.intent.is_control())
            .filter(|m| m.is_addressed_to(agent) && !m.is_expired(now))
            .filter(|m| !acked.contains(&m.id.as_str()))
            .cloned()
            .collect())
    }

    /// Compare-and-set under the log lock: append a control record if the
    /// referenced message's status passes `check`.
    fn append_control<F>(&self, id: &str, agent: &str, intent: Intent, check: F) -> Result<BusMessage, BusError>
    where
        F: FnOnce(MessageStatus) -> Result<(), BusError>,
    {
        let _lock = self.log.lock()?;
        let messages = self.log.read_all()?;
        let status =
            Self::derive_status(&messages, id).ok_or_else(|| BusError::MessageNotFound(id.to_string()))?;
        check(status)?;

        let original = messages.iter().find(|m| m.id == id);
        let outgoing = Outgoing {
            from: agent.to_string(),
            to: original.map_or_else(|| BROADCAST.to_string(), |m| m.from.clone()),
            intent,
            payload: serde_json::Value::Null,
            ttl: None,
            trace_id: original.and_then(|m| m.trace_id.clone()),
        };
        let record = self.build(outgoing, Some(id.to_string()), Utc::now());
        self.log.append_unlocked(&record)?;
        Ok(record)
    }

    /// Claim an open message. A message already claimed or acked is refused.
    pub fn claim(&self, id: &str, agent: &str) -> Result<BusMessage, BusError> {
        let record = self.append_control(id, agent, Intent::Claim, |status| match status {
            MessageStatus::Open => Ok(()),
            MessageStatus::Claimed => Err(BusError::NotClaimable {
                id: id.to_string(),
                status: "claimed".to_string(),
            }),
            MessageStatus::Acked => Err(BusError::NotClaimable {
                id: id.to_string(),
                status: "acked".to_string(),
            }),
        })?;
        info!(id, agent, "bus message claimed");
        Ok(record)
    }

    pub fn ack(&self, id: &str, agent: &str) -> Result<BusMessage, BusError> {
        let record = self.append_control(id, agent, Intent::Ack, |status| match status {
            MessageStatus::Acked => Err(BusError::AlreadyAcked(id.to_string())),
            _ => Ok(()),
        })?;
        info!(id, agent, "bus message acked");
        Ok(record)
    }

    /// Open a proposal and announce it on the bus.
    pub fn propose(&self, title: &str, proposer: &str, quorum: usize) -> Result<Proposal, BusError> {
        if quorum == 0 {
            return Err(BusError::InvalidQuorum(quorum));
        }
        let proposal = Proposal {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            proposer: proposer.to_string(),
            votes: BTreeMap::new(),
            quorum,
            status: ProposalStatus::Proposed,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let stored = proposal.clone();
        self.proposals.update(ProposalTable::new, move |table| {
            table.insert(stored.id.clone(), stored);
        })?;

        self.send(Outgoing::new(
            proposer,
            BROADCAST,
            Intent::Proposal,
            json!({"proposal_id": proposal.id, "title": title, "quorum": quorum}),
        ))?;
        info!(proposal_id = %proposal.id, title, quorum, "proposal opened");
        Ok(proposal)
    }

    /// Record a vote. The agent's latest vote replaces any earlier one.
    pub fn vote(&self, proposal_id: &str, agent: &str, decision: VoteDecision) -> Result<Proposal, BusError> {
        let proposal = self.proposals.update(ProposalTable::new, |table| {
            let proposal = table
                .get_mut(proposal_id)
                .ok_or_else(|| BusError::ProposalNotFound(proposal_id.to_string()))?;
            if proposal.status.is_resolved() {
                return Err(BusError::ProposalResolved(proposal_id.to_string()));
            }
            proposal.apply_vote(agent, decision);
            Ok(proposal.clone())
        })??;

        self.send(Outgoing::new(
            agent,
            BROADCAST,
            Intent::Vote,
            json!({"proposal_id": proposal_id, "decision": decision, "status": proposal.status}),
        ))?;
        if proposal.status.is_resolved() {
            info!(proposal_id, status = ?proposal.status, "proposal resolved");
        }
        Ok(proposal)
    }

    pub fn proposal(&self, proposal_id: &str) -> Result<Proposal, BusError> {
        self.proposals
            .load()?
            .and_then(|mut table| table.remove(proposal_id))
            .ok_or_else(|| BusError::ProposalNotFound(proposal_id.to_string()))
    }

    pub fn proposals(&self) -> Result<Vec<Proposal>, BusError> {
        Ok(self
            .proposals
            .load()?
            .map(|table| table.into_values().collect())
            .unwrap_or_default())
    }
}
