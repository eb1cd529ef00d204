//! Single-owner, TTL-bound leases on job ids.
//!
//! The lease table is one JSON document; every operation is a locked
//! read-modify-write so two dispatchers cannot both acquire the same id.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::errors::StorageError;
use crate::domain::models::{duration_from_secs, Lease, LeaseOutcome, RenewOutcome};
use crate::infrastructure::storage::JsonDocument;

type LeaseTable = BTreeMap<String, Lease>;

#[derive(Debug, Clone)]
pub struct LeaseManager {
    table: JsonDocument<LeaseTable>,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(path: impl Into<PathBuf>, ttl_secs: u64) -> Self {
        Self {
            table: JsonDocument::new(path),
            ttl: duration_from_secs(ttl_secs),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take the lease unless another owner holds an unexpired one.
    ///
    /// Re-acquiring a lease already held by `owner` extends it.
    pub fn acquire(&self, job_id: &str, owner: &str, now: DateTime<Utc>) -> Result<LeaseOutcome, StorageError> {
        let ttl = self.ttl;
        let outcome = self.table.update(LeaseTable::new, |table| {
            if let Some(current) = table.get(job_id) {
                if !current.is_expired(now) && current.owner != owner {
                    return LeaseOutcome::Held {
                        owner: current.owner.clone(),
                        expires_at: current.expires_at,
                    };
                }
            }
            let issued_at = table
                .get(job_id)
                .filter(|l| l.is_held_by(owner, now))
                .map_or(now, |l| l.issued_at);
            let lease = Lease {
                owner: owner.to_string(),
                issued_at,
                updated_at: now,
                expires_at: now + ttl,
            };
            table.insert(job_id.to_string(), lease.clone());
            LeaseOutcome::Acquired(lease)
        })?;
        debug!(job_id, owner, acquired = outcome.is_acquired(), "lease acquire");
        Ok(outcome)
    }

    /// Extend a lease still held by `owner`.
    pub fn renew(&self, job_id: &str, owner: &str, now: DateTime<Utc>) -> Result<RenewOutcome, StorageError> {
        let ttl = self.ttl;
        self.table.update(LeaseTable::new, |table| match table.get_mut(job_id) {
            Some(lease) if lease.is_held_by(owner, now) => {
                lease.updated_at = now;
                lease.expires_at = now + ttl;
                RenewOutcome::Renewed(lease.clone())
            }
            Some(lease) => RenewOutcome::Lost {
                current_owner: (!lease.is_expired(now)).then(|| lease.owner.clone()),
            },
            None => RenewOutcome::Lost {
                current_owner: None,
            },
        })
    }

    /// Drop the lease if `owner` holds it. Returns whether anything was removed.
    pub fn release(&self, job_id: &str, owner: &str) -> Result<bool, StorageError> {
        let released = self.table.update(LeaseTable::new, |table| {
            if table.get(job_id).is_some_and(|l| l.owner == owner) {
                table.remove(job_id);
                true
            } else {
                false
            }
        })?;
        debug!(job_id, owner, released, "lease release");
        Ok(released)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Lease>, StorageError> {
        Ok(self
            .table
            .load()?
            .and_then(|mut table| table.remove(job_id)))
    }

    /// Remove expired leases, returning their job ids.
    pub fn reap(&self, now: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        self.table.update(LeaseTable::new, |table| {
            let expired: Vec<String> = table
                .iter()
                .filter(|(_, lease)| lease.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                table.remove(id);
            }
            expired
        })
    }
}
