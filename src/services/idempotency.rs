//! TTL-bound set of recently processed ids.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::domain::errors::StorageError;
use crate::domain::models::duration_from_secs;
use crate::infrastructure::storage::JsonDocument;

/// id -> time it was marked.
type SeenTable = BTreeMap<String, DateTime<Utc>>;

#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    doc: JsonDocument<SeenTable>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(path: impl Into<PathBuf>, ttl_secs: u64) -> Self {
        Self {
            doc: JsonDocument::new(path),
            ttl: duration_from_secs(ttl_secs),
        }
    }

    fn live(&self, marked_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - marked_at < self.ttl
    }

    /// Whether `id` was marked within the TTL window.
    pub fn contains(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        Ok(self
            .doc
            .load()?
            .and_then(|table| table.get(id).copied())
            .is_some_and(|marked_at| self.live(marked_at, now)))
    }

    /// Mark `id` as processed. Expired entries are pruned on the way.
    pub fn mark(&self, id: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        let ttl = self.ttl;
        self.doc.update(SeenTable::new, |table| {
            table.retain(|_, marked_at| now - *marked_at < ttl);
            table.insert(id.to_string(), now);
        })
    }

    /// Atomically mark `id` unless it is already live. Returns true when newly marked.
    pub fn check_and_mark(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let ttl = self.ttl;
        self.doc.update(SeenTable::new, |table| {
            table.retain(|_, marked_at| now - *marked_at < ttl);
            if table.contains_key(id) {
                false
            } else {
                table.insert(id.to_string(), now);
                true
            }
        })
    }

    /// Forget `id`, e.g. when a delivery is requeued by an operator.
    pub fn forget(&self, id: &str) -> Result<(), StorageError> {
        self.doc.update(SeenTable::new, |table| {
            table.remove(id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mark_and_expire() {
        let dir = TempDir::new().unwrap();
        let store = IdempotencyStore::new(dir.path().join("idem.json"), 60);
        let now = Utc::now();

        assert!(!store.contains("a", now).unwrap());
        store.mark("a", now).unwrap();
        assert!(store.contains("a", now + Duration::seconds(59)).unwrap());
        assert!(!store.contains("a", now + Duration::seconds(60)).unwrap());
    }

    #[test]
    fn test_check_and_mark_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = IdempotencyStore::new(dir.path().join("idem.json"), 60);
        let now = Utc::now();

        assert!(store.check_and_mark("t", now).unwrap());
        assert!(!store.check_and_mark("t", now).unwrap());
        assert!(store.check_and_mark("t", now + Duration::seconds(61)).unwrap());

        store.forget("t").unwrap();
        assert!(!store.contains("t", now + Duration::seconds(61)).unwrap());
    }
}
