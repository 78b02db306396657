//! Shared filesystem helpers.

use crate::error::{Error, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Write `data` to `path` atomically.
///
/// The bytes go to a temp file in the same directory which is then renamed
/// over the target, so readers see either the old or the new content.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".ovm-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &data)
}

/// Recursively delete a directory tree.
///
/// Refuses empty and root paths. A missing directory is success.
pub fn remove_dir_all_guarded(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || path.parent().is_none() {
        return Err(Error::RefusingDelete(path.to_path_buf()));
    }
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::storage(
            format!("remove {}", path.display()),
            e.to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("file.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        // no temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_remove_dir_all_guarded_refuses_root_and_empty() {
        assert!(matches!(
            remove_dir_all_guarded(Path::new("")),
            Err(Error::RefusingDelete(_))
        ));
        assert!(matches!(
            remove_dir_all_guarded(Path::new("/")),
            Err(Error::RefusingDelete(_))
        ));
    }

    #[test]
    fn test_remove_dir_all_guarded_missing_is_ok() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("gone");
        remove_dir_all_guarded(&dir).unwrap();

        std::fs::create_dir_all(dir.join("a/b")).unwrap();
        remove_dir_all_guarded(&dir).unwrap();
        assert!(!dir.exists());
    }
}
