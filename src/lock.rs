//! Advisory file locks for cross-process mutual exclusion.
//!
//! Independent `ovm` invocations coordinate through sibling `.lck` files
//! locked with the OS advisory primitive (`flock`/`LockFileEx`).

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// A lock file on disk. Acquiring it yields a [`LockGuard`].
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Create a handle for the lock file at `path`. No I/O.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the exclusive lock is held.
    pub fn acquire(&self) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)?;
        FileExt::lock_exclusive(&file).map_err(|e| {
            Error::config(format!("lock {}", self.path.display()), e.to_string())
        })?;
        tracing::trace!(path = %self.path.display(), "lock acquired");
        Ok(LockGuard { file })
    }
}

/// Held lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(error = %e, "unlock failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lock_excludes_other_handles() {
        let temp = tempfile::tempdir().unwrap();
        let lock = FileLock::new(temp.path().join("x.lck"));

        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let inside = inside.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let _guard = lock.acquire().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::sleep(std::time::Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
