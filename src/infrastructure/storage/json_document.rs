//! Whole-file JSON documents written atomically.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use super::lock::FileLock;
use crate::domain::errors::StorageError;

/// A JSON document on disk with locked read-modify-write.
#[derive(Debug, Clone)]
pub struct JsonDocument<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> JsonDocument<T>
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

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the document; `None` when the file does not exist.
    pub fn load(&self) -> Result<Option<T>, StorageError> {
        read_json(&self.path)
    }

    /// Replace the document atomically.
    pub fn save(&self, value: &T) -> Result<(), StorageError> {
        let _lock = FileLock::exclusive(&self.path)?;
        write_json_atomic(&self.path, value)
    }

    pub fn remove(&self) -> Result<(), StorageError> {
        let _lock = FileLock::exclusive(&self.path)?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&self.path, e)),
        }
    }

    /// Load (or create with `init`), mutate under an exclusive lock, and persist.
    ///
    /// The closure's return value is passed through. The document is written
    /// even when the closure made no change.
    pub fn update<R, F>(&self, init: impl FnOnce() -> T, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut T) -> R,
    {
        let _lock = FileLock::exclusive(&self.path)?;
        let mut value = read_json(&self.path)?.unwrap_or_else(init);
        let result = f(&mut value);
        write_json_atomic(&self.path, &value)?;
        Ok(result)
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StorageError::serde(path, e))
}

/// Write via a temp file in the same directory, then rename over the target.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;

    let body = serde_json::to_vec_pretty(value).map_err(|e| StorageError::serde(path, e))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut file = std::fs::File::create(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
    file.write_all(&body).map_err(|e| StorageError::io(&tmp, e))?;
    file.sync_all().map_err(|e| StorageError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
}
