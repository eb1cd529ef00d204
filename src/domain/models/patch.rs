use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to one fenced diff block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BlockOutcome {
    Applied,
    /// Malformed new documentation file written from its added lines.
    Salvaged,
    Rejected { reason: String },
    RolledBack { reason: String },
    /// Verification failed and the reverse apply did not restore the tree.
    RollbackFailed { reason: String },
}

impl BlockOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied | Self::Salvaged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReport {
    pub index: usize,
    pub paths: Vec<String>,
    pub bytes: usize,
    #[serde(flatten)]
    pub outcome: BlockOutcome,
}

/// Persisted record of applying a round's winning output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchReceipt {
    pub round_id: String,
    pub agent: String,
    pub applied_at: DateTime<Utc>,
    pub blocks: Vec<BlockReport>,
}

impl PatchReceipt {
    pub fn applied_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.outcome.is_applied()).count()
    }

    /// A block whose rollback failed left changes in the working tree.
    pub fn rollback_failed(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b.outcome, BlockOutcome::RollbackFailed { .. }))
    }
}
