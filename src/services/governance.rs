//! Governance gates: daily budgets, fairness, approval tokens and the kill switch.
//!
//! Every denial is written to the audit log before the caller acts on it.
//! Budget documents are rotated on read when the local date changed; the
//! rotation is persisted on the next spend.

use chrono::{Local, NaiveDate};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::audit_log::{AuditAction, AuditCategory, AuditLevel, AuditLog, AuditRecord};
use crate::domain::errors::{DenialKind, DispatchError, StorageError};
use crate::domain::models::{ApprovalTokenEntry, BudgetRecord, FairnessEntry, GovernanceConfig, Job};
use crate::infrastructure::storage::{FileLock, JsonDocument, JsonlLog, StateLayout};

type ApprovalRegistry = BTreeMap<String, ApprovalTokenEntry>;

const ACTOR: &str = "governance";

/// Fairness share of one agent over the recent window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FairnessShare {
    pub share: f64,
    pub samples: usize,
}

/// Snapshot of both budget scopes for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetSnapshot {
    pub global: BudgetRecord,
    pub agent: BudgetRecord,
}

#[derive(Debug, Clone)]
pub struct Governance {
    layout: StateLayout,
    config: GovernanceConfig,
    audit: AuditLog,
    fairness: JsonlLog<FairnessEntry>,
}

impl Governance {
    pub fn new(layout: StateLayout, config: GovernanceConfig) -> Self {
        let audit = AuditLog::new(layout.audit());
        let fairness = JsonlLog::new(layout.fairness());
        Self {
            layout,
            config,
            audit,
            fairness,
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    fn global_doc(&self) -> JsonDocument<BudgetRecord> {
        JsonDocument::new(self.layout.global_budget())
    }

    fn agent_doc(&self, agent: &str) -> JsonDocument<BudgetRecord> {
        JsonDocument::new(self.layout.agent_budget(agent))
    }

    fn load_rotated(doc: &JsonDocument<BudgetRecord>, default_limit: f64) -> Result<BudgetRecord, StorageError> {
        let today = Self::today();
        let mut record = doc
            .load()?
            .unwrap_or_else(|| BudgetRecord::new(today, default_limit));
        record.rotate(today);
        Ok(record)
    }

    /// Current budgets, rotated to today.
    pub fn budgets(&self, agent: &str) -> Result<BudgetSnapshot, StorageError> {
        Ok(BudgetSnapshot {
            global: Self::load_rotated(&self.global_doc(), self.config.global_daily_limit_usd)?,
            agent: Self::load_rotated(&self.agent_doc(agent), self.config.agent_daily_limit_usd)?,
        })
    }

    /// Deny when either scope cannot absorb `additional`. Non-positive limits deny everything.
    pub fn check_budget(&self, job: &Job, trace_id: &str) -> Result<(), DispatchError> {
        let agent = job.owning_agent();
        let additional = job.policy.estimated_spend_usd;
        let snapshot = self.budgets(agent)?;

        let denial = if !snapshot.global.allows(additional) {
            Some(("global", &snapshot.global))
        } else if !snapshot.agent.allows(additional) {
            Some(("agent", &snapshot.agent))
        } else {
            None
        };

        if let Some((scope, record)) = denial {
            let reason = format!(
                "{scope} budget: spent {:.4} + {:.4} exceeds limit {:.4}",
                record.spent_today_usd, additional, record.daily_limit_usd
            );
            self.deny(job, trace_id, DenialKind::Budget, AuditAction::BudgetDenied, &reason, json!({
                "scope": scope,
                "agent": agent,
                "spent_today_usd": record.spent_today_usd,
                "daily_limit_usd": record.daily_limit_usd,
                "additional_usd": additional,
            }))?;
            return Err(DispatchError::PolicyDenied {
                kind: DenialKind::Budget,
                reason,
            });
        }
        Ok(())
    }

    /// Share of `agent` among the last `fairness_window` fairness entries.
    pub fn fairness_share(&self, agent: &str) -> Result<FairnessShare, StorageError> {
        let recent = self.fairness.tail(self.config.fairness_window)?;
        let samples = recent.len();
        if samples == 0 {
            return Ok(FairnessShare { share: 0.0, samples });
        }
        let mine = recent.iter().filter(|e| e.agent_id == agent).count();
        #[allow(clippy::cast_precision_loss)]
        let share = mine as f64 / samples as f64;
        Ok(FairnessShare { share, samples })
    }

    pub fn check_fairness(&self, job: &Job, trace_id: &str) -> Result<(), DispatchError> {
        let agent = job.owning_agent();
        let FairnessShare { share, samples } = self.fairness_share(agent)?;
        if samples < self.config.fairness_min_samples || share <= self.config.fairness_cap {
            return Ok(());
        }

        let reason = format!(
            "agent {agent} share {share:.2} exceeds cap {:.2} over {samples} entries",
            self.config.fairness_cap
        );
        self.deny(job, trace_id, DenialKind::Fairness, AuditAction::FairnessDenied, &reason, json!({
            "agent": agent,
            "share": share,
            "samples": samples,
            "cap": self.config.fairness_cap,
        }))?;
        Err(DispatchError::PolicyDenied {
            kind: DenialKind::Fairness,
            reason,
        })
    }

    pub fn register_fairness(&self, agent: &str, job_id: &str) -> Result<(), StorageError> {
        self.fairness.append(&FairnessEntry::new(agent, job_id))
    }

    /// Hex `sha256(salt || token)`.
    pub fn token_digest(&self, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.config.approval_salt.as_bytes());
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn approvals(&self) -> JsonDocument<ApprovalRegistry> {
        JsonDocument::new(self.layout.approvals())
    }

    /// Store a token by digest so the raw value never lands on disk.
    pub fn register_approval(&self, token: &str, note: Option<String>) -> Result<String, StorageError> {
        let digest = self.token_digest(token);
        let key = digest.clone();
        self.approvals().update(ApprovalRegistry::new, move |registry| {
            registry.insert(key, ApprovalTokenEntry { active: true, note });
        })?;
        Ok(digest)
    }

    /// Whether `token` matches an active entry by raw value or by digest.
    pub fn token_is_active(&self, token: &str) -> Result<bool, StorageError> {
        let registry = self.approvals().load()?.unwrap_or_default();
        let digest = self.token_digest(token);
        Ok([token, digest.as_str()]
            .iter()
            .any(|key| registry.get(*key).is_some_and(|entry| entry.active)))
    }

    /// Approval gate. A missing or inactive token is a terminal denial.
    pub fn verify_approval(&self, job: &Job, trace_id: &str) -> Result<(), DispatchError> {
        if !job.requires_human_approval {
            return Ok(());
        }
        let approved = match job.approval_token.as_deref() {
            Some(token) if !token.is_empty() => self.token_is_active(token)?,
            _ => false,
        };
        if approved {
            return Ok(());
        }

        let reason = if job.approval_token.is_some() {
            "approval token not active".to_string()
        } else {
            "approval required but no token supplied".to_string()
        };
        self.deny(job, trace_id, DenialKind::Approval, AuditAction::ApprovalDenied, &reason, json!({
            "agent": job.owning_agent(),
        }))?;
        Err(DispatchError::PolicyDenied {
            kind: DenialKind::Approval,
            reason,
        })
    }

    pub fn kill_switch_engaged(&self) -> bool {
        self.layout.kill_switch().exists()
    }

    pub fn engage_kill_switch(&self, reason: &str) -> Result<(), StorageError> {
        let path = self.layout.kill_switch();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        std::fs::write(&path, reason).map_err(|e| StorageError::io(&path, e))?;
        warn!(reason, "kill switch engaged");
        Ok(())
    }

    pub fn release_kill_switch(&self) -> Result<(), StorageError> {
        let path = self.layout.kill_switch();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("kill switch released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    fn governance_lock(&self) -> Result<FileLock, StorageError> {
        FileLock::exclusive(&self.layout.root().join("governance"))
    }

    /// Final pre-execution check under the governance lock: kill switch and
    /// both budgets are re-read so a concurrent dispatcher cannot overspend.
    pub fn authorize_spend(&self, job: &Job, trace_id: &str) -> Result<(), DispatchError> {
        let _lock = self.governance_lock()?;

        if self.kill_switch_engaged() {
            self.audit.record(
                &AuditRecord::new(
                    AuditLevel::Critical,
                    AuditCategory::Governance,
                    AuditAction::KillSwitchHalt,
                    ACTOR,
                    "kill switch engaged before execution",
                )
                .with_job(&job.id)
                .with_trace(trace_id),
            )?;
            return Err(DispatchError::KillSwitch);
        }

        self.check_budget(job, trace_id)?;
        self.audit.record(
            &AuditRecord::new(
                AuditLevel::Decision,
                AuditCategory::Governance,
                AuditAction::SpendAuthorized,
                ACTOR,
                format!("authorized {:.4} USD", job.policy.estimated_spend_usd),
            )
            .with_job(&job.id)
            .with_trace(trace_id)
            .with_detail("agent", json!(job.owning_agent())),
        )?;
        Ok(())
    }

    /// Record a completed job's spend in the global and agent budgets.
    pub fn record_spend(&self, job: &Job, trace_id: &str) -> Result<(), StorageError> {
        let _lock = self.governance_lock()?;
        let today = Self::today();
        let amount = job.policy.estimated_spend_usd;

        let global_limit = self.config.global_daily_limit_usd;
        let global = self.global_doc().update(
            || BudgetRecord::new(today, global_limit),
            |record| {
                record.rotate(today);
                record.record(&job.id, amount);
                record.spent_today_usd
            },
        )?;

        let agent_limit = self.config.agent_daily_limit_usd;
        let agent = self.agent_doc(job.owning_agent()).update(
            || BudgetRecord::new(today, agent_limit),
            |record| {
                record.rotate(today);
                record.record(&job.id, amount);
                record.spent_today_usd
            },
        )?;

        self.audit.record(
            &AuditRecord::new(
                AuditLevel::Info,
                AuditCategory::Governance,
                AuditAction::SpendRecorded,
                ACTOR,
                format!("recorded {amount:.4} USD"),
            )
            .with_job(&job.id)
            .with_trace(trace_id)
            .with_detail("global_spent_usd", json!(global))
            .with_detail("agent_spent_usd", json!(agent)),
        )
    }

    fn deny(
        &self,
        job: &Job,
        trace_id: &str,
        kind: DenialKind,
        action: AuditAction,
        reason: &str,
        details: serde_json::Value,
    ) -> Result<(), StorageError> {
        warn!(job_id = %job.id, trace_id, gate = kind.as_str(), reason, "policy denied");
        let mut record = AuditRecord::new(
            AuditLevel::Decision,
            AuditCategory::Governance,
            action,
            ACTOR,
            reason,
        )
        .with_job(&job.id)
        .with_trace(trace_id);
        if let serde_json::Value::Object(map) = details {
            for (key, value) in map {
                record = record.with_detail(key, value);
            }
        }
        self.audit.record(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::audit_log::AuditFilter;
    use tempfile::TempDir;

    fn governance(config: GovernanceConfig) -> (TempDir, Governance) {
        let dir = TempDir::new().unwrap();
        let gov = Governance::new(StateLayout::new(dir.path()), config);
        (dir, gov)
    }

    #[test]
    fn test_zero_limit_denies_zero_cost_job_and_audits() {
        let (_dir, gov) = governance(GovernanceConfig {
            global_daily_limit_usd: 0.0,
            ..GovernanceConfig::default()
        });
        let job = Job::new("j1", "echo", "research");

        let err = gov.check_budget(&job, "t").unwrap_err();
        assert!(matches!(
            err,
            DispatchError::PolicyDenied {
                kind: DenialKind::Budget,
                ..
            }
        ));

        let audited = gov
            .audit()
            .query(&AuditFilter::new().with_action(AuditAction::BudgetDenied))
            .unwrap();
        assert_eq!(audited.len(), 1);
        assert_eq!(audited[0].job_id.as_deref(), Some("j1"));
    }

    #[test]
    fn test_agent_budget_denies_independently() {
        let (_dir, gov) = governance(GovernanceConfig {
            global_daily_limit_usd: 100.0,
            agent_daily_limit_usd: 1.0,
            ..GovernanceConfig::default()
        });
        let first = Job::new("a", "echo", "research").with_spend(0.8);
        gov.check_budget(&first, "t").unwrap();
        gov.record_spend(&first, "t").unwrap();

        let second = Job::new("b", "echo", "research").with_spend(0.5);
        assert!(gov.check_budget(&second, "t").is_err());

        let other_agent = Job::new("c", "echo", "ops").with_spend(0.5);
        assert!(gov.check_budget(&other_agent, "t").is_ok());

        let snapshot = gov.budgets("research").unwrap();
        assert!((snapshot.global.spent_today_usd - 0.8).abs() < 1e-9);
        assert_eq!(snapshot.agent.events.len(), 1);
    }

    #[test]
    fn test_stale_budget_rotates_preserving_limit() {
        let (dir, gov) = governance(GovernanceConfig::default());
        let layout = StateLayout::new(dir.path());
        let mut stale = BudgetRecord::new(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), 2.5);
        stale.record("old", 2.5);
        JsonDocument::new(layout.global_budget()).save(&stale).unwrap();

        let snapshot = gov.budgets("x").unwrap();
        assert_eq!(snapshot.global.spent_today_usd, 0.0);
        assert!((snapshot.global.daily_limit_usd - 2.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.global.date, Local::now().date_naive());
    }

    #[test]
    fn test_fairness_requires_min_samples() {
        let (_dir, gov) = governance(GovernanceConfig {
            fairness_window: 20,
            fairness_cap: 0.6,
            fairness_min_samples: 10,
            ..GovernanceConfig::default()
        });
        let job = Job::new("next", "echo", "hog");

        for i in 0..9 {
            gov.register_fairness("hog", &format!("j{i}")).unwrap();
        }
        gov.check_fairness(&job, "t").unwrap();

        gov.register_fairness("hog", "j9").unwrap();
        let err = gov.check_fairness(&job, "t").unwrap_err();
        assert!(err.is_soft());

        let share = gov.fairness_share("hog").unwrap();
        assert_eq!(share.samples, 10);
        assert!((share.share - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fairness_allows_balanced_agents() {
        let (_dir, gov) = governance(GovernanceConfig::default());
        for i in 0..20 {
            let agent = if i % 2 == 0 { "a" } else { "b" };
            gov.register_fairness(agent, &format!("j{i}")).unwrap();
        }
        gov.check_fairness(&Job::new("x", "echo", "a"), "t").unwrap();
    }

    #[test]
    fn test_approval_by_raw_token_and_digest() {
        let (dir, gov) = governance(GovernanceConfig {
            approval_salt: "pepper".to_string(),
            ..GovernanceConfig::default()
        });
        let layout = StateLayout::new(dir.path());

        gov.register_approval("s3cret", None).unwrap();
        let job = Job::new("j", "echo", "ops").requiring_approval(Some("s3cret".to_string()));
        gov.verify_approval(&job, "t").unwrap();

        JsonDocument::<ApprovalRegistry>::new(layout.approvals())
            .update(ApprovalRegistry::new, |r| {
                r.insert(
                    "raw-token".to_string(),
                    ApprovalTokenEntry {
                        active: true,
                        note: None,
                    },
                );
                r.insert(
                    "revoked".to_string(),
                    ApprovalTokenEntry {
                        active: false,
                        note: None,
                    },
                );
            })
            .unwrap();
        let raw = Job::new("k", "echo", "ops").requiring_approval(Some("raw-token".to_string()));
        gov.verify_approval(&raw, "t").unwrap();

        let revoked = Job::new("r", "echo", "ops").requiring_approval(Some("revoked".to_string()));
        let err = gov.verify_approval(&revoked, "t").unwrap_err();
        assert!(!err.is_soft());

        let missing = Job::new("m", "echo", "ops").requiring_approval(None);
        assert!(gov.verify_approval(&missing, "t").is_err());
    }

    #[test]
    fn test_authorize_spend_honours_kill_switch() {
        let (_dir, gov) = governance(GovernanceConfig::default());
        let job = Job::new("j", "echo", "ops");
        gov.authorize_spend(&job, "t").unwrap();

        gov.engage_kill_switch("maintenance").unwrap();
        assert!(matches!(
            gov.authorize_spend(&job, "t"),
            Err(DispatchError::KillSwitch)
        ));
        gov.release_kill_switch().unwrap();
        assert!(!gov.kill_switch_engaged());
    }
}
