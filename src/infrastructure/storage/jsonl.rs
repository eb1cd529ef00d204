//! Append-only newline-delimited JSON logs.
//!
//! One logical writer appends under a lock; readers replay everything written
//! so far. Malformed lines are skipped with a warning rather than failing the
//! replay, so a torn final line after a crash does not wedge the system.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::lock::FileLock;
use crate::domain::errors::StorageError;

#[derive(Debug, Clone)]
pub struct JsonlLog<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> JsonlLog<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record.
    pub fn append(&self, record: &T) -> Result<(), StorageError> {
        let _lock = FileLock::exclusive(&self.path)?;
        self.append_unlocked(record)
    }

    /// Append while the caller already holds [`Self::lock`].
    pub fn append_unlocked(&self, record: &T) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let mut line = serde_json::to_string(record).map_err(|e| StorageError::serde(&self.path, e))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.flush().map_err(|e| StorageError::io(&self.path, e))
    }

    /// Hold the log's writer lock across a read-then-append sequence.
    pub fn lock(&self) -> Result<FileLock, StorageError> {
        FileLock::exclusive(&self.path)
    }

    /// Replay every well-formed record in append order.
    pub fn read_all(&self) -> Result<Vec<T>, StorageError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };

        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<T>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Skipping malformed log line");
                    None
                }
            })
            .collect())
    }

    /// The most recent `n` records.
    pub fn tail(&self, n: usize) -> Result<Vec<T>, StorageError> {
        let mut all = self.read_all()?;
        let skip = all.len().saturating_sub(n);
        Ok(all.split_off(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        n: u32,
    }

    #[test]
    fn test_append_and_replay_in_order() {
        let dir = TempDir::new().unwrap();
        let log: JsonlLog<Rec> = JsonlLog::new(dir.path().join("log.jsonl"));

        for n in 0..5 {
            log.append(&Rec { n }).unwrap();
        }

        let all = log.read_all().unwrap();
        assert_eq!(all.iter().map(|r| r.n).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(log.tail(2).unwrap(), vec![Rec { n: 3 }, Rec { n: 4 }]);
    }

    #[test]
    fn test_missing_log_replays_empty() {
        let dir = TempDir::new().unwrap();
        let log: JsonlLog<Rec> = JsonlLog::new(dir.path().join("none.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"n\":1}\n{torn\n\n{\"n\":2}\n").unwrap();

        let log: JsonlLog<Rec> = JsonlLog::new(&path);
        assert_eq!(log.read_all().unwrap(), vec![Rec { n: 1 }, Rec { n: 2 }]);
    }
}
