//! Disk images.
//!
//! Root images are copied (or decompressed) from a user-supplied boot
//! image into the machine's data directory. The data disk is a sparse raw
//! file sized in GiB, recreated whenever its version label changes.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const GIB: u64 = 1024 * 1024 * 1024;

/// Compression of a boot image, from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain image, copied as is.
    None,
    /// gzip (`.gz`).
    Gzip,
    /// Zstandard (`.zst`).
    Zstd,
}

impl Compression {
    /// Detect by file extension.
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Compression::Gzip,
            Some("zst") | Some("zstd") => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

/// Materialise `src` at `dst`, decompressing if needed.
///
/// Output goes to a temp file beside `dst` and is renamed into place, so a
/// failed or interrupted copy never leaves a truncated image at `dst`.
pub fn decompress(src: &Path, dst: &Path) -> Result<()> {
    let compression = Compression::detect(src);
    tracing::info!(
        src = %src.display(),
        dst = %dst.display(),
        ?compression,
        "materialising disk image"
    );

    let input = File::open(src).map_err(|e| Error::Path {
        path: src.to_path_buf(),
        source: e,
    })?;
    let mut input = BufReader::new(input);

    let parent = dst
        .parent()
        .ok_or_else(|| Error::storage("decompress image", "destination has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".ovm-image-")
        .suffix(".part")
        .tempfile_in(parent)
        .map_err(|e| Error::storage("create temp image", e.to_string()))?;

    let copied = match compression {
        Compression::None => io::copy(&mut input, tmp.as_file_mut()),
        Compression::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(input);
            io::copy(&mut decoder, tmp.as_file_mut())
        }
        Compression::Zstd => {
            let mut decoder = zstd::stream::read::Decoder::new(input)
                .map_err(|e| Error::storage("open zstd stream", e.to_string()))?;
            io::copy(&mut decoder, tmp.as_file_mut())
        }
    }
    .map_err(|e| Error::storage("decompress image", e.to_string()))?;

    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::storage("sync image", e.to_string()))?;
    tmp.persist(dst)
        .map_err(|e| Error::storage("place image", e.to_string()))?;

    tracing::debug!(bytes = copied, dst = %dst.display(), "disk image in place");
    Ok(())
}

/// Sparse raw data disk.
#[derive(Debug, Clone)]
pub struct DataDisk {
    path: PathBuf,
    size_bytes: u64,
}

impl DataDisk {
    /// Open the disk if present, otherwise create it sparse.
    pub fn open_or_create_at(path: &Path, size_gb: u64) -> Result<Self> {
        validate_size(size_gb)?;
        if path.exists() {
            let metadata = std::fs::metadata(path)?;
            return Ok(Self {
                path: path.to_path_buf(),
                size_bytes: metadata.len(),
            });
        }
        Self::recreate(path, size_gb)
    }

    /// Discard any existing contents and create a fresh sparse disk.
    pub fn recreate(path: &Path, size_gb: u64) -> Result<Self> {
        validate_size(size_gb)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let size_bytes = size_gb * GIB;

        tracing::info!(path = %path.display(), size_gb, "creating sparse data disk");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::storage("create data disk", e.to_string()))?;
        file.seek(SeekFrom::Start(size_bytes - 1))
            .map_err(|e| Error::storage("extend data disk", e.to_string()))?;
        file.write_all(&[0])
            .map_err(|e| Error::storage("extend data disk", e.to_string()))?;
        file.sync_all()
            .map_err(|e| Error::storage("sync data disk", e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            size_bytes,
        })
    }

    /// Path to the disk image.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Size in GiB.
    pub fn size_gb(&self) -> u64 {
        self.size_bytes / GIB
    }

    /// Delete the disk. Missing is fine.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_size(size_gb: u64) -> Result<()> {
    if size_gb == 0 {
        return Err(Error::config(
            "validate disk size",
            "disk size must be greater than 0 GB",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_detect_compression() {
        assert_eq!(Compression::detect(Path::new("a.raw.gz")), Compression::Gzip);
        assert_eq!(Compression::detect(Path::new("a.raw.zst")), Compression::Zstd);
        assert_eq!(Compression::detect(Path::new("a.raw")), Compression::None);
        assert_eq!(Compression::detect(Path::new("image")), Compression::None);
    }

    #[test]
    fn test_plain_copy() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("img.raw");
        std::fs::write(&src, b"rootfs").unwrap();
        let dst = temp.path().join("out").join("vm1.raw");

        decompress(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"rootfs");
    }

    #[test]
    fn test_gzip_image() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("img.raw.gz");
        let mut enc = flate2::write::GzEncoder::new(
            File::create(&src).unwrap(),
            flate2::Compression::default(),
        );
        enc.write_all(b"compressed rootfs").unwrap();
        enc.finish().unwrap();

        let dst = temp.path().join("vm1.raw");
        decompress(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"compressed rootfs");
    }

    #[test]
    fn test_zstd_image() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("img.raw.zst");
        let data = zstd::stream::encode_all(&b"zstd rootfs"[..], 3).unwrap();
        std::fs::write(&src, data).unwrap();

        let dst = temp.path().join("vm1.raw");
        decompress(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"zstd rootfs");
    }

    #[test]
    fn test_corrupt_gzip_leaves_no_image() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("img.raw.gz");
        std::fs::write(&src, b"not gzip at all").unwrap();
        let dst = temp.path().join("vm1.raw");

        assert!(decompress(&src, &dst).is_err());
        assert!(!dst.exists());
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().starts_with(".ovm-image-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_missing_source() {
        let temp = tempfile::tempdir().unwrap();
        let err = decompress(&temp.path().join("nope.raw"), &temp.path().join("x")).unwrap_err();
        assert!(matches!(err, Error::Path { .. }));
    }

    #[test]
    fn test_data_disk_recreate_truncates() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("vm1-data.raw");

        let disk = DataDisk::open_or_create_at(&path, 1).unwrap();
        assert_eq!(disk.size_gb(), 1);
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.write_all(b"old data").unwrap();
        }

        let disk = DataDisk::recreate(&path, 2).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * GIB);
        let mut head = [0u8; 8];
        File::open(&path).unwrap().read_exact(&mut head).unwrap();
        assert_eq!(head, [0u8; 8]);

        disk.delete().unwrap();
        disk.delete().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_zero_size_rejected() {
        let temp = tempfile::tempdir().unwrap();
        assert!(DataDisk::recreate(&temp.path().join("d.raw"), 0).is_err());
    }
}
