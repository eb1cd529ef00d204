//! On-disk layout of the state directory.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::domain::models::JobLocation;

/// Resolves every state file from one root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue_dir(&self, location: JobLocation) -> PathBuf {
        self.root.join("queue").join(location.dir_name())
    }

    pub fn inbox(&self) -> PathBuf {
        self.queue_dir(JobLocation::Inbox)
    }

    pub fn ledger(&self) -> PathBuf {
        self.root.join("ledger.jsonl")
    }

    pub fn fairness(&self) -> PathBuf {
        self.root.join("fairness.jsonl")
    }

    pub fn audit(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }

    pub fn global_budget(&self) -> PathBuf {
        self.root.join("budget").join("global.json")
    }

    pub fn agent_budget(&self, agent: &str) -> PathBuf {
        self.root
            .join("budget")
            .join("agents")
            .join(format!("{}.json", sanitize(agent)))
    }

    pub fn approvals(&self) -> PathBuf {
        self.root.join("approvals.json")
    }

    pub fn leases(&self) -> PathBuf {
        self.root.join("leases.json")
    }

    pub fn idempotency(&self) -> PathBuf {
        self.root.join("idempotency.json")
    }

    pub fn breaker(&self) -> PathBuf {
        self.root.join("circuit_breaker.json")
    }

    pub fn kill_switch(&self) -> PathBuf {
        self.root.join("KILL_SWITCH")
    }

    pub fn bus(&self) -> PathBuf {
        self.root.join("council").join("bus.jsonl")
    }

    pub fn proposals(&self) -> PathBuf {
        self.root.join("council").join("proposals.json")
    }

    pub fn rounds_dir(&self) -> PathBuf {
        self.root.join("council").join("rounds")
    }

    pub fn round_dir(&self, round_id: &str) -> PathBuf {
        self.rounds_dir().join(sanitize(round_id))
    }

    pub fn round_report(&self, round_id: &str) -> PathBuf {
        self.round_dir(round_id).join("verdicts.json")
    }

    pub fn patch_receipt(&self, round_id: &str) -> PathBuf {
        self.round_dir(round_id).join("patch_applied.json")
    }

    pub fn patch_dir(&self, round_id: &str) -> PathBuf {
        self.round_dir(round_id).join("patches")
    }

    pub fn reflection(&self) -> PathBuf {
        self.root.join("council").join("reflection.json")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.root.join("router").join("outbox")
    }

    pub fn dlq_dir(&self) -> PathBuf {
        self.root.join("router").join("dlq")
    }

    pub fn router_idempotency(&self) -> PathBuf {
        self.root.join("router").join("idempotency.json")
    }
}

/// Keep ids usable as single path components.
/// JSON file name for an arbitrary id: the sanitized id plus a short digest
/// of the raw id, so ids that sanitize alike still get distinct files.
pub fn digest_file_name(id: &str) -> String {
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{}-{}.json", sanitize(id), &digest[..12])
}

pub fn sanitize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("job-1"), "job-1");
        assert_eq!(sanitize("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize("a b/c"), "a_b_c");
        assert_eq!(sanitize(".."), "_");
    }

    #[test]
    fn test_digest_file_name_separates_colliding_ids() {
        let slash = digest_file_name("task/1");
        let colon = digest_file_name("task:1");
        assert_ne!(slash, colon);
        assert!(slash.starts_with("task_1-") && slash.ends_with(".json"));
        assert_eq!(digest_file_name("task/1"), slash);
    }

    #[test]
    fn test_paths_under_root() {
        let layout = StateLayout::new("/tmp/s");
        assert_eq!(layout.inbox(), PathBuf::from("/tmp/s/queue/inbox"));
        assert_eq!(
            layout.agent_budget("research"),
            PathBuf::from("/tmp/s/budget/agents/research.json")
        );
        assert_eq!(
            layout.patch_receipt("r1"),
            PathBuf::from("/tmp/s/council/rounds/r1/patch_applied.json")
        );
    }
}
