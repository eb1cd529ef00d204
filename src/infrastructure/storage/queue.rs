//! Directory-backed job queue: inbox, processed and failed.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::json_document::write_json_atomic;
use super::layout::{sanitize, StateLayout};
use crate::domain::errors::StorageError;
use crate::domain::models::{Job, JobLocation};

/// A document found in the inbox.
#[derive(Debug, Clone)]
pub struct QueuedDocument {
    pub path: PathBuf,
    /// File stem, used as the job id when the document cannot be parsed.
    pub file_id: String,
    pub arrived_at: SystemTime,
    pub parsed: Result<Job, String>,
}

impl QueuedDocument {
    pub fn job_id(&self) -> &str {
        match &self.parsed {
            Ok(job) => &job.id,
            Err(_) => &self.file_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    layout: StateLayout,
}

impl JobQueue {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        for location in [JobLocation::Inbox, JobLocation::Processed, JobLocation::Failed] {
            let dir = self.layout.queue_dir(location);
            std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Drop a job document into the inbox.
    pub fn submit(&self, job: &Job) -> Result<PathBuf, StorageError> {
        let path = self
            .layout
            .inbox()
            .join(format!("{}.json", sanitize(&job.id)));
        write_json_atomic(&path, job)?;
        Ok(path)
    }

    /// Inbox documents in arrival order (modification time, then file name).
    pub fn scan(&self) -> Result<Vec<QueuedDocument>, StorageError> {
        let inbox = self.layout.inbox();
        let entries = match std::fs::read_dir(&inbox) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&inbox, e)),
        };

        let mut docs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&inbox, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let arrived_at = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let file_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|body| serde_json::from_str::<Job>(&body).map_err(|e| e.to_string()));

            docs.push(QueuedDocument {
                path,
                file_id,
                arrived_at,
                parsed,
            });
        }

        docs.sort_by(|a, b| {
            a.arrived_at
                .cmp(&b.arrived_at)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(docs)
    }

    /// Move a document out of the inbox. Never overwrites an existing file.
    pub fn move_to(&self, path: &Path, location: JobLocation) -> Result<PathBuf, StorageError> {
        let dir = self.layout.queue_dir(location);
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job.json".to_string());
        let mut target = dir.join(&name);
        if target.exists() {
            let stem = name.trim_end_matches(".json");
            let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.f");
            target = dir.join(format!("{stem}.{stamp}.json"));
        }

        std::fs::rename(path, &target).map_err(|e| StorageError::io(path, e))?;
        Ok(target)
    }

    /// File names currently in one location.
    pub fn list(&self, location: JobLocation) -> Result<Vec<String>, StorageError> {
        let dir = self.layout.queue_dir(location);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&dir, e)),
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".json"))
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queue() -> (TempDir, JobQueue) {
        let dir = TempDir::new().unwrap();
        let queue = JobQueue::new(StateLayout::new(dir.path()));
        queue.ensure_dirs().unwrap();
        (dir, queue)
    }

    #[test]
    fn test_submit_scan_and_move() {
        let (_dir, queue) = queue();
        let path = queue.submit(&Job::new("job-1", "echo", "research")).unwrap();

        let docs = queue.scan().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].job_id(), "job-1");
        assert!(docs[0].parsed.is_ok());

        queue.move_to(&path, JobLocation::Processed).unwrap();
        assert!(queue.scan().unwrap().is_empty());
        assert_eq!(queue.list(JobLocation::Processed).unwrap(), vec!["job-1.json"]);
    }

    #[test]
    fn test_malformed_document_uses_file_stem() {
        let (dir, queue) = queue();
        std::fs::write(dir.path().join("queue/inbox/broken.json"), "{oops").unwrap();

        let docs = queue.scan().unwrap();
        assert_eq!(docs[0].job_id(), "broken");
        assert!(docs[0].parsed.is_err());
    }

    #[test]
    fn test_move_never_overwrites() {
        let (_dir, queue) = queue();
        let first = queue.submit(&Job::new("dup", "echo", "a")).unwrap();
        queue.move_to(&first, JobLocation::Failed).unwrap();
        let second = queue.submit(&Job::new("dup", "echo", "a")).unwrap();
        queue.move_to(&second, JobLocation::Failed).unwrap();

        assert_eq!(queue.list(JobLocation::Failed).unwrap().len(), 2);
    }
}
