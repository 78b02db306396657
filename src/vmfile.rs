//! Path wrapper for machine-related files and directories.
//!
//! A [`VmFile`] may name a config file, a disk image, a socket or a
//! directory. It serializes as a plain path string.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A filesystem path used by a machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmFile {
    path: PathBuf,
}

impl VmFile {
    /// Wrap a path without touching the filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path as given.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute form of the path, resolved against the current directory.
    ///
    /// The path need not exist.
    pub fn abs_path(&self) -> Result<PathBuf> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::Path {
                path: self.path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty path"),
            });
        }
        std::path::absolute(&self.path).map_err(|source| Error::Path {
            path: self.path.clone(),
            source,
        })
    }

    /// Create this path as a directory tree. Idempotent.
    pub fn create_path(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path).map_err(|source| Error::Path {
            path: self.path.clone(),
            source,
        })
    }

    /// Whether anything exists at this path.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the whole file.
    pub fn read(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(&self.path)?)
    }

    /// Remove the file. `NotFound` is surfaced so callers can decide.
    pub fn delete(&self) -> Result<()> {
        Ok(std::fs::remove_file(&self.path)?)
    }

    /// Remove the file, treating "already absent" as success.
    pub fn delete_if_exists(&self) -> Result<()> {
        match self.delete() {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// A new `VmFile` for `child` under this path. No I/O.
    pub fn append(&self, child: impl AsRef<Path>) -> VmFile {
        VmFile::new(self.path.join(child))
    }
}

impl fmt::Display for VmFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl AsRef<Path> for VmFile {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl From<PathBuf> for VmFile {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_is_pure() {
        let dir = VmFile::new("/nonexistent/ovm");
        let child = dir.append("vm1.json");
        assert_eq!(child.path(), Path::new("/nonexistent/ovm/vm1.json"));
        assert!(!child.exists());
    }

    #[test]
    fn test_abs_path_resolves_relative() {
        let file = VmFile::new("relative/disk.raw");
        let abs = file.abs_path().unwrap();
        assert!(abs.is_absolute());
        assert!(abs.ends_with("relative/disk.raw"));

        assert!(VmFile::new("").abs_path().is_err());
    }

    #[test]
    fn test_create_read_delete() {
        let temp = tempfile::tempdir().unwrap();
        let dir = VmFile::new(temp.path()).append("a/b");
        dir.create_path().unwrap();
        dir.create_path().unwrap();

        let file = dir.append("data");
        std::fs::write(file.path(), b"hello").unwrap();
        assert_eq!(file.read().unwrap(), b"hello");

        file.delete().unwrap();
        assert!(file.delete().unwrap_err().is_not_found());
        file.delete_if_exists().unwrap();
    }

    #[test]
    fn test_serializes_as_string() {
        let file = VmFile::new("/tmp/x.json");
        assert_eq!(serde_json::to_string(&file).unwrap(), r#""/tmp/x.json""#);
    }
}
