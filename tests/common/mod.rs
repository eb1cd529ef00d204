//! Shared fixtures for integration tests.

#![allow(dead_code)]

use conclave::domain::models::Config;
use conclave::infrastructure::storage::StateLayout;
use std::path::Path;
use tempfile::TempDir;

/// A temporary state directory plus a config pointing at it.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let mut config = Config::default();
        config.paths.state_dir = dir.path().join("state");
        config.paths.repo_root = dir.path().join("repo");
        config.dispatcher.owner = Some("test-owner".to_string());
        config.dispatcher.lease_ttl_secs = 30;
        std::fs::create_dir_all(&config.paths.repo_root).expect("create repo dir");
        Self { dir, config }
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::new(&self.config.paths.state_dir)
    }

    pub fn repo(&self) -> &Path {
        &self.config.paths.repo_root
    }

    /// Write an agent's output for a council round.
    pub fn write_output(&self, round_id: &str, agent: &str, text: &str) {
        let dir = self.layout().round_dir(round_id);
        std::fs::create_dir_all(&dir).expect("create round dir");
        std::fs::write(dir.join(format!("{agent}.md")), text).expect("write output");
    }
}

/// A substantive answer that passes every detector.
pub const CLEAN_OUTPUT: &str = "I reviewed how the dispatcher orders the inbox. Jobs are scored by \
their bid minus the risk penalty and a small spend term, then ties fall back to arrival order \
and file name. The ordering is sound; my only suggestion is to record the computed score in \
the queued ledger entry so operators can see why a job waited behind another one.\n";
