//! Advisory file locks guarding read-modify-write of state files.

use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::domain::errors::StorageError;

/// Exclusive lock on `<target>.lock`, released on drop.
#[derive(Debug)]
pub struct FileLock {
    _guard: Flock<File>,
    path: PathBuf,
}

impl FileLock {
    /// Block until an exclusive lock on the sibling lock file is held.
    pub fn exclusive(target: &Path) -> Result<Self, StorageError> {
        let path = lock_path(target);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        let guard = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            StorageError::Lock {
                path: path.display().to_string(),
                reason: errno.desc().to_string(),
            }
        })?;

        Ok(Self {
            _guard: guard,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}
