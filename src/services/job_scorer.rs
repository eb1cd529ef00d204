use std::cmp::Ordering;

use crate::domain::models::{GovernanceConfig, Job, RiskPenalties};
use crate::infrastructure::storage::QueuedDocument;

/// Auction-style job priority
///
/// Score formula: bid - risk_penalty(risk) - spend_weight * estimated_spend_usd
#[derive(Debug, Clone)]
pub struct JobScorer {
    penalties: RiskPenalties,
    spend_weight: f64,
}

impl Default for JobScorer {
    fn default() -> Self {
        Self::new()
    }
}

/// A queued document with its score.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: QueuedDocument,
    /// `None` for documents that failed to parse.
    pub score: Option<f64>,
}

impl JobScorer {
    /// Create a scorer with default penalties (0/10/25/50) and spend weight 0.05
    pub fn new() -> Self {
        Self::with_weights(RiskPenalties::default(), 0.05)
    }

    pub fn with_weights(penalties: RiskPenalties, spend_weight: f64) -> Self {
        Self {
            penalties,
            spend_weight,
        }
    }

    pub fn from_config(config: &GovernanceConfig) -> Self {
        Self::with_weights(config.risk_penalties.clone(), config.spend_weight)
    }

    /// Calculate the score for a job
    pub fn calculate(&self, job: &Job) -> f64 {
        job.policy.bid
            - self.penalties.for_tier(job.policy.risk)
            - self.spend_weight * job.policy.estimated_spend_usd
    }

    /// Order documents for service.
    ///
    /// Malformed documents come first so they are moved out of the inbox
    /// promptly. The rest are served by descending score, ties broken by
    /// arrival time and then file name.
    pub fn order(&self, documents: Vec<QueuedDocument>) -> Vec<ScoredDocument> {
        let mut scored: Vec<ScoredDocument> = documents
            .into_iter()
            .map(|document| {
                let score = document.parsed.as_ref().ok().map(|job| self.calculate(job));
                ScoredDocument { document, score }
            })
            .collect();

        scored.sort_by(|a, b| {
            let by_score = match (a.score, b.score) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => y.total_cmp(&x),
            };
            by_score
                .then_with(|| a.document.arrived_at.cmp(&b.document.arrived_at))
                .then_with(|| a.document.path.cmp(&b.document.path))
        });
        scored
    }
}
