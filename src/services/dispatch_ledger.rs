//! Append-only per-job state transitions.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::errors::StorageError;
use crate::domain::models::{LedgerEntry, LedgerState};
use crate::infrastructure::storage::JsonlLog;

#[derive(Debug, Clone)]
pub struct DispatchLedger {
    log: JsonlLog<LedgerEntry>,
}

impl DispatchLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            log: JsonlLog::new(path),
        }
    }

    pub fn append(&self, entry: &LedgerEntry) -> Result<(), StorageError> {
        debug!(job_id = %entry.job_id, state = %entry.state, trace_id = ?entry.trace_id, "ledger");
        self.log.append(entry)
    }

    /// Shorthand for appending a bare state transition.
    pub fn transition(
        &self,
        job_id: &str,
        state: LedgerState,
        trace_id: &str,
        details: serde_json::Value,
    ) -> Result<(), StorageError> {
        self.append(
            &LedgerEntry::new(job_id, state)
                .with_details(details)
                .with_trace(trace_id),
        )
    }

    pub fn entries(&self) -> Result<Vec<LedgerEntry>, StorageError> {
        self.log.read_all()
    }

    /// Every entry for one job, in order.
    pub fn history(&self, job_id: &str) -> Result<Vec<LedgerEntry>, StorageError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.job_id == job_id)
            .collect())
    }

    pub fn states(&self, job_id: &str) -> Result<Vec<LedgerState>, StorageError> {
        Ok(self.history(job_id)?.into_iter().map(|e| e.state).collect())
    }

    /// The most recent `k` terminal entries across all jobs.
    pub fn recent_terminal(&self, k: usize) -> Result<Vec<LedgerEntry>, StorageError> {
        let mut terminal: Vec<LedgerEntry> = self
            .entries()?
            .into_iter()
            .filter(|e| e.state.is_terminal())
            .collect();
        let skip = terminal.len().saturating_sub(k);
        Ok(terminal.split_off(skip))
    }

    /// Terminal entries recorded strictly after `since`.
    pub fn terminal_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>, StorageError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.state.is_terminal() && e.ts > since)
            .collect())
    }

    /// Count of entries per state.
    pub fn summary(&self) -> Result<BTreeMap<String, usize>, StorageError> {
        let mut counts = BTreeMap::new();
        for entry in self.entries()? {
            *counts.entry(entry.state.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_history_and_recent_terminal() {
        let dir = TempDir::new().unwrap();
        let ledger = DispatchLedger::new(dir.path().join("ledger.jsonl"));

        for state in [
            LedgerState::Queued,
            LedgerState::Leased,
            LedgerState::Running,
            LedgerState::Acked,
        ] {
            ledger.transition("a", state, "t", json!(null)).unwrap();
        }
        ledger
            .transition("b", LedgerState::Failed, "t", json!({"reason": "x"}))
            .unwrap();
        ledger
            .transition("c", LedgerState::Skipped, "t", json!(null))
            .unwrap();

        assert_eq!(
            ledger.states("a").unwrap(),
            vec![
                LedgerState::Queued,
                LedgerState::Leased,
                LedgerState::Running,
                LedgerState::Acked
            ]
        );

        let terminal = ledger.recent_terminal(10).unwrap();
        assert_eq!(terminal.len(), 2);
        assert_eq!(terminal[1].state, LedgerState::Failed);

        let last_one = ledger.recent_terminal(1).unwrap();
        assert_eq!(last_one[0].job_id, "b");

        let summary = ledger.summary().unwrap();
        assert_eq!(summary["skipped"], 1);
    }
}
