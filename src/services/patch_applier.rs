//! Applies the winning agent's fenced diffs to the repository.
//!
//! Every block is gated and applied on its own, so one bad block never
//! blocks its siblings. The outcome of each block lands in the round's
//! patch receipt, which is written after every run.

use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use super::audit_log::{AuditAction, AuditCategory, AuditLevel, AuditLog, AuditRecord};
use super::diff_parser::{check_path, declared_files, extract_blocks, numstat_paths, path_matches, DiffBlock};
use crate::domain::errors::{PatchError, StorageError};
use crate::domain::models::{BlockOutcome, BlockReport, PatchConfig, PatchReceipt, RoundReport};
use crate::infrastructure::storage::{JsonDocument, StateLayout};

const ACTOR: &str = "patch_applier";
const OUTPUT_EXTENSIONS: &[&str] = &["md", "txt"];

/// Result of [`PatchApplier::apply_round`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub receipt: PatchReceipt,
    /// An earlier run already applied a block or left a failed rollback
    /// behind; nothing was touched.
    pub skipped: bool,
}

#[derive(Debug)]
struct CommandOutcome {
    success: bool,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Clone)]
pub struct PatchApplier {
    layout: StateLayout,
    config: PatchConfig,
    repo_root: PathBuf,
    audit: AuditLog,
}

impl PatchApplier {
    pub fn new(layout: StateLayout, config: PatchConfig, repo_root: impl Into<PathBuf>) -> Self {
        let audit = AuditLog::new(layout.audit());
        Self {
            layout,
            config,
            repo_root: repo_root.into(),
            audit,
        }
    }

    fn receipt_doc(&self, round_id: &str) -> JsonDocument<PatchReceipt> {
        JsonDocument::new(self.layout.patch_receipt(round_id))
    }

    pub fn receipt(&self, round_id: &str) -> Result<Option<PatchReceipt>, StorageError> {
        self.receipt_doc(round_id).load()
    }

    /// Apply every diff block in the round winner's output.
    #[instrument(skip(self))]
    pub async fn apply_round(&self, round_id: &str, verify: bool) -> Result<ApplyResult, PatchError> {
        if let Some(receipt) = self.receipt(round_id)? {
            if receipt.applied_count() > 0 || receipt.rollback_failed() {
                info!(
                    round_id,
                    applied = receipt.applied_count(),
                    rollback_failed = receipt.rollback_failed(),
                    "round already patched, skipping"
                );
                return Ok(ApplyResult {
                    receipt,
                    skipped: true,
                });
            }
        }

        let report = JsonDocument::<RoundReport>::new(self.layout.round_report(round_id))
            .load()?
            .ok_or_else(|| PatchError::ReportMissing(round_id.to_string()))?;
        let winner = report
            .winner
            .ok_or_else(|| PatchError::NoWinner(round_id.to_string()))?;
        let output_path = self
            .output_path(round_id, &winner)
            .ok_or_else(|| PatchError::OutputMissing(format!("{round_id}/{winner}")))?;
        let text = std::fs::read_to_string(&output_path).map_err(|e| StorageError::io(&output_path, e))?;

        let declared = declared_files(&text);
        let blocks = extract_blocks(&text);
        info!(round_id, agent = %winner, blocks = blocks.len(), "applying winner output");

        let mut receipt = PatchReceipt {
            round_id: round_id.to_string(),
            agent: winner,
            applied_at: Utc::now(),
            blocks: Vec::with_capacity(blocks.len()),
        };

        for block in &blocks {
            let outcome = match self.apply_block(round_id, block, &declared, verify).await {
                Ok(outcome) => outcome,
                Err(PatchError::Rejected { reason, .. }) => BlockOutcome::Rejected { reason },
                Err(PatchError::VerificationFailed { reason, .. }) => BlockOutcome::RolledBack { reason },
                Err(PatchError::RollbackFailed { reason, .. }) => BlockOutcome::RollbackFailed { reason },
                Err(e) => {
                    self.receipt_doc(round_id).save(&receipt)?;
                    return Err(e);
                }
            };
            let halt = matches!(outcome, BlockOutcome::RollbackFailed { .. });
            let block_report = BlockReport {
                index: block.index,
                paths: block.touched_paths(),
                bytes: block.len(),
                outcome,
            };
            self.audit_block(&receipt, &block_report)?;
            receipt.blocks.push(block_report);
            if halt {
                error!(round_id, block = block.index, "working tree left dirty, skipping remaining blocks");
                break;
            }
        }

        self.receipt_doc(round_id).save(&receipt)?;
        info!(
            round_id,
            applied = receipt.applied_count(),
            total = receipt.blocks.len(),
            "patch receipt written"
        );
        Ok(ApplyResult {
            receipt,
            skipped: false,
        })
    }

    fn output_path(&self, round_id: &str, agent: &str) -> Option<PathBuf> {
        let dir = self.layout.round_dir(round_id);
        OUTPUT_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{agent}.{ext}")))
            .find(|p| p.is_file())
    }

    /// Gate checks that need nothing but the block text.
    fn check_block(&self, block: &DiffBlock, declared: &[String]) -> Result<Vec<String>, PatchError> {
        let reject = |reason: String| PatchError::Rejected {
            index: block.index,
            reason,
        };

        if block.len() > self.config.max_block_bytes {
            return Err(reject(format!(
                "block is {} bytes, limit is {}",
                block.len(),
                self.config.max_block_bytes
            )));
        }

        let paths = block.touched_paths();
        if paths.is_empty() {
            return Err(reject("no file headers found".to_string()));
        }
        for path in &paths {
            check_path(path).map_err(reject)?;
        }

        if self.config.require_declaration {
            let undeclared: Vec<&str> = paths
                .iter()
                .filter(|p| !declared.contains(p))
                .map(String::as_str)
                .collect();
            if !undeclared.is_empty() {
                return Err(reject(format!("undeclared paths: {}", undeclared.join(", "))));
            }
        }

        if paths.len() > self.config.max_files {
            return Err(reject(format!(
                "touches {} files, limit is {}",
                paths.len(),
                self.config.max_files
            )));
        }

        for path in &paths {
            if let Some(pattern) = self.config.blocklist.iter().find(|p| path_matches(p, path)) {
                return Err(reject(format!("{path} matches blocklist entry {pattern}")));
            }
            if !self.config.allow_any_path && !self.config.allowed_dirs.iter().any(|dir| within_dir(dir, path)) {
                return Err(reject(format!("{path} is outside the allowed directories")));
            }
        }

        Ok(paths)
    }

    async fn apply_block(
        &self,
        round_id: &str,
        block: &DiffBlock,
        declared: &[String],
        verify: bool,
    ) -> Result<BlockOutcome, PatchError> {
        let gated = self.check_block(block, declared)?;
        let patch = self.write_patch(round_id, block)?;
        let patch_arg = patch.to_string_lossy().into_owned();

        // git decides which files it writes; every one of them must have
        // passed the gates above.
        let stat = self.git(&["apply", "--numstat", "-z", &patch_arg]).await?;
        if stat.success {
            let ungated: Vec<String> = numstat_paths(&stat.stdout)
                .into_iter()
                .filter(|p| !gated.contains(p))
                .collect();
            if !ungated.is_empty() {
                return Err(PatchError::Rejected {
                    index: block.index,
                    reason: format!("git would touch ungated paths: {}", ungated.join(", ")),
                });
            }
        }

        let check = self.git(&["apply", "--check", &patch_arg]).await?;
        let outcome = if check.success {
            let applied = self.git(&["apply", &patch_arg]).await?;
            if !applied.success {
                return Err(PatchError::Rejected {
                    index: block.index,
                    reason: format!("git apply failed: {}", applied.stderr),
                });
            }
            BlockOutcome::Applied
        } else {
            self.salvage(block, &check.stderr)?
        };

        if verify && !self.config.verify_command.is_empty() {
            let health = self.verify().await?;
            if !health.success {
                warn!(round_id, block = block.index, "verification failed, reverting block");
                self.revert(block, &outcome, &patch_arg).await?;
                return Err(PatchError::VerificationFailed {
                    index: block.index,
                    reason: health.stderr,
                });
            }
        }

        Ok(outcome)
    }

    /// A documentation file the dry run refused is written straight from its
    /// added lines, as long as it does not exist yet.
    fn salvage(&self, block: &DiffBlock, check_error: &str) -> Result<BlockOutcome, PatchError> {
        let rejected = || PatchError::Rejected {
            index: block.index,
            reason: format!("git apply --check failed: {check_error}"),
        };
        let Some((path, content)) = block.salvageable_document() else {
            return Err(rejected());
        };
        let target = self.repo_root.join(&path);
        if target.exists() {
            return Err(rejected());
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        std::fs::write(&target, content).map_err(|e| StorageError::io(&target, e))?;
        info!(block = block.index, path = %path, "salvaged malformed documentation diff");
        Ok(BlockOutcome::Salvaged)
    }

    async fn revert(&self, block: &DiffBlock, outcome: &BlockOutcome, patch_arg: &str) -> Result<(), PatchError> {
        let failed = |reason: String| PatchError::RollbackFailed {
            index: block.index,
            reason,
        };
        match outcome {
            BlockOutcome::Salvaged => {
                if let Some((path, _)) = block.salvageable_document() {
                    let target = self.repo_root.join(&path);
                    std::fs::remove_file(&target).map_err(|e| failed(format!("removing {path}: {e}")))?;
                }
            }
            _ => {
                let reverse = self.git(&["apply", "-R", patch_arg]).await?;
                if !reverse.success {
                    error!(block = block.index, stderr = %reverse.stderr, "reverse apply failed");
                    return Err(failed(format!("git apply -R failed: {}", reverse.stderr)));
                }
            }
        }
        Ok(())
    }

    fn write_patch(&self, round_id: &str, block: &DiffBlock) -> Result<PathBuf, PatchError> {
        let dir = self.layout.patch_dir(round_id);
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        let path = dir.join(format!("block-{}.patch", block.index));
        let mut body = block.body.clone();
        if !body.ends_with('\n') {
            body.push('\n');
        }
        std::fs::write(&path, body).map_err(|e| StorageError::io(&path, e))?;
        // git runs inside the repository, so hand it an absolute path.
        Ok(std::fs::canonicalize(&path).map_err(|e| StorageError::io(&path, e))?)
    }

    async fn git(&self, args: &[&str]) -> Result<CommandOutcome, PatchError> {
        run(&self.config.git_binary, args, &self.repo_root).await
    }

    async fn verify(&self) -> Result<CommandOutcome, PatchError> {
        let Some((program, args)) = self.config.verify_command.split_first() else {
            return Ok(CommandOutcome {
                success: true,
                stdout: String::new(),
                stderr: String::new(),
            });
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run(program, &args, &self.repo_root).await
    }

    fn audit_block(&self, receipt: &PatchReceipt, block: &BlockReport) -> Result<(), StorageError> {
        let (level, action, message) = match &block.outcome {
            BlockOutcome::Applied => (AuditLevel::Decision, AuditAction::PatchApplied, "block applied".to_string()),
            BlockOutcome::Salvaged => (
                AuditLevel::Decision,
                AuditAction::PatchApplied,
                "documentation block salvaged".to_string(),
            ),
            BlockOutcome::Rejected { reason } => (AuditLevel::Warning, AuditAction::PatchRejected, reason.clone()),
            BlockOutcome::RolledBack { reason } => (
                AuditLevel::Warning,
                AuditAction::PatchRolledBack,
                format!("verification failed: {reason}"),
            ),
            BlockOutcome::RollbackFailed { reason } => (
                AuditLevel::Critical,
                AuditAction::PatchRollbackFailed,
                format!("verification failed and rollback did not complete: {reason}"),
            ),
        };
        self.audit.record(
            &AuditRecord::new(level, AuditCategory::Patch, action, ACTOR, message)
                .with_trace(&receipt.round_id)
                .with_detail("round_id", json!(receipt.round_id))
                .with_detail("agent", json!(receipt.agent))
                .with_detail("block", json!(block.index))
                .with_detail("paths", json!(block.paths)),
        )
    }
}

/// Whether `path` sits under the directory prefix `dir`.
fn within_dir(dir: &str, path: &str) -> bool {
    let dir = dir.trim_start_matches("./").trim_end_matches('/');
    dir.is_empty() || path.starts_with(&format!("{dir}/"))
}

async fn run(program: &str, args: &[&str], cwd: &Path) -> Result<CommandOutcome, PatchError> {
    let command = format!("{program} {}", args.join(" "));
    debug!(command = %command, "running");
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| PatchError::Command {
            command: command.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        stderr = stdout.trim().to_string();
    }
    if stderr.is_empty() && !output.status.success() {
        stderr = format!("{command} exited with {}", output.status);
    }
    Ok(CommandOutcome {
        success: output.status.success(),
        stdout,
        stderr,
    })
}
