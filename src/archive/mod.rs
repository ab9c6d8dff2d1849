// src/archive/mod.rs

//! Content-addressed archive of image blobs.
//!
//! Two optional files per fingerprint live under the image directory:
//! `<fp>` (metadata or unified blob) and `<fp>.rootfs` (split rootfs).
//! Writes stream into temp files inside the same directory and rename into
//! place only after the fingerprint check passes, so a crash never leaves a
//! half-written blob under a valid name.

pub mod compression;
pub mod metadata;

use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, FingerprintHasher};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Open streams for a stored image
#[derive(Debug)]
pub struct ArchiveStreams {
    pub meta: File,
    pub rootfs: Option<File>,
}

/// On-disk image blob store
#[derive(Debug, Clone)]
pub struct ImageArchive {
    dir: PathBuf,
}

impl ImageArchive {
    /// Open (creating if needed) the archive at the given directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The image directory itself
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the meta/unified blob for a fingerprint
    pub fn blob_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(fingerprint.as_str())
    }

    /// Path of the split rootfs blob for a fingerprint
    pub fn rootfs_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.rootfs", fingerprint))
    }

    /// Whether the meta blob is present locally
    pub fn exists(&self, fingerprint: &Fingerprint) -> bool {
        self.blob_path(fingerprint).exists()
    }

    /// Whether the image is stored in split format
    pub fn is_split(&self, fingerprint: &Fingerprint) -> bool {
        self.rootfs_path(fingerprint).exists()
    }

    /// Total stored size (meta plus rootfs when split)
    pub fn size(&self, fingerprint: &Fingerprint) -> Result<u64> {
        let mut total = fs::metadata(self.blob_path(fingerprint))
            .map_err(|_| Error::not_found("Image file"))?
            .len();

        let rootfs = self.rootfs_path(fingerprint);
        if rootfs.exists() {
            total += fs::metadata(rootfs)?.len();
        }

        Ok(total)
    }

    /// Stream blobs into the archive.
    ///
    /// The fingerprint is computed across the canonical concatenation (meta
    /// then rootfs). When `expected` is supplied a mismatch is fatal and no
    /// file is published. Returns the fingerprint and total byte size.
    pub fn write(
        &self,
        meta: &mut dyn Read,
        rootfs: Option<&mut dyn Read>,
        expected: Option<&Fingerprint>,
    ) -> Result<(Fingerprint, u64)> {
        let mut hasher = FingerprintHasher::new();
        let mut size = 0u64;

        let mut meta_tmp = tempfile::Builder::new()
            .prefix(".paddock_image_")
            .tempfile_in(&self.dir)?;
        size += copy_hashing(meta, meta_tmp.as_file_mut(), &mut hasher)?;

        let mut rootfs_tmp = None;
        if let Some(rootfs) = rootfs {
            let mut tmp = tempfile::Builder::new()
                .prefix(".paddock_image_")
                .tempfile_in(&self.dir)?;
            size += copy_hashing(rootfs, tmp.as_file_mut(), &mut hasher)?;
            rootfs_tmp = Some(tmp);
        }

        let fingerprint = hasher.finalize();

        if let Some(expected) = expected {
            if &fingerprint != expected {
                return Err(Error::Integrity(format!(
                    "Fingerprints don't match, got {} expected {}",
                    fingerprint, expected
                )));
            }
        }

        meta_tmp
            .persist(self.blob_path(&fingerprint))
            .map_err(|e| Error::Io(e.error))?;

        if let Some(tmp) = rootfs_tmp {
            tmp.persist(self.rootfs_path(&fingerprint))
                .map_err(|e| Error::Io(e.error))?;
        }

        debug!("Stored image blob {} ({} bytes)", fingerprint, size);
        Ok((fingerprint, size))
    }

    /// Publish already-staged temp files under their fingerprint.
    ///
    /// Used by ingestion paths that hash on the fly while spooling; the
    /// rename is atomic because the temp files live inside the image
    /// directory.
    pub fn publish(
        &self,
        fingerprint: &Fingerprint,
        meta_tmp: &Path,
        rootfs_tmp: Option<&Path>,
    ) -> Result<()> {
        fs::rename(meta_tmp, self.blob_path(fingerprint))?;
        if let Some(rootfs_tmp) = rootfs_tmp {
            fs::rename(rootfs_tmp, self.rootfs_path(fingerprint))?;
        }
        Ok(())
    }

    /// Open read streams; not-found when the meta blob (or, for split
    /// images, the rootfs blob) is absent
    pub fn read(&self, fingerprint: &Fingerprint, split: bool) -> Result<ArchiveStreams> {
        let meta = File::open(self.blob_path(fingerprint))
            .map_err(|_| Error::not_found("Image file"))?;

        let rootfs_path = self.rootfs_path(fingerprint);
        let rootfs = if rootfs_path.exists() {
            Some(File::open(rootfs_path)?)
        } else if split {
            return Err(Error::not_found("Image rootfs file"));
        } else {
            None
        };

        Ok(ArchiveStreams { meta, rootfs })
    }

    /// Remove both blob files; missing files are fine
    pub fn delete(&self, fingerprint: &Fingerprint) -> Result<()> {
        for path in [self.blob_path(fingerprint), self.rootfs_path(fingerprint)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed image file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// All file names in the image directory (leftover scanning)
    pub fn entries(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    /// Detect the compression of a stored blob
    pub fn detect_compression(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<compression::CompressionFormat> {
        let mut file = File::open(self.blob_path(fingerprint))
            .map_err(|_| Error::not_found("Image file"))?;
        compression::CompressionFormat::from_file(&mut file)
    }
}

fn copy_hashing(
    reader: &mut dyn Read,
    writer: &mut File,
    hasher: &mut FingerprintHasher,
) -> Result<u64> {
    let mut buffer = [0u8; 65536];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }

    writer.flush()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;

    fn archive() -> (tempfile::TempDir, ImageArchive) {
        let dir = tempfile::tempdir().unwrap();
        let archive = ImageArchive::open(dir.path().join("images")).unwrap();
        (dir, archive)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (_dir, archive) = archive();

        let mut meta: &[u8] = b"meta tarball";
        let (fp, size) = archive.write(&mut meta, None, None).unwrap();

        assert_eq!(fp, fingerprint_bytes(b"meta tarball"));
        assert_eq!(size, 12);
        assert!(archive.exists(&fp));
        assert!(!archive.is_split(&fp));

        let mut streams = archive.read(&fp, false).unwrap();
        let mut out = Vec::new();
        streams.meta.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"meta tarball");
        assert!(streams.rootfs.is_none());
    }

    #[test]
    fn test_split_write_hashes_concatenation() {
        let (_dir, archive) = archive();

        let mut meta: &[u8] = b"meta";
        let mut rootfs: &[u8] = b"rootfs";
        let (fp, size) = archive.write(&mut meta, Some(&mut rootfs), None).unwrap();

        assert_eq!(fp, fingerprint_bytes(b"metarootfs"));
        assert_eq!(size, 10);
        assert!(archive.is_split(&fp));
        assert_eq!(archive.size(&fp).unwrap(), 10);
    }

    #[test]
    fn test_expected_mismatch_is_fatal_and_clean() {
        let (_dir, archive) = archive();

        let wrong = fingerprint_bytes(b"something else");
        let mut meta: &[u8] = b"meta";
        let err = archive.write(&mut meta, None, Some(&wrong)).unwrap_err();
        assert!(err.to_string().contains("don't match"));

        // No temp files survive in the image directory
        assert!(archive.entries().unwrap().is_empty());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, archive) = archive();

        let mut meta: &[u8] = b"meta";
        let mut rootfs: &[u8] = b"rootfs";
        let (fp, _) = archive.write(&mut meta, Some(&mut rootfs), None).unwrap();

        archive.delete(&fp).unwrap();
        assert!(!archive.exists(&fp));
        assert!(!archive.is_split(&fp));

        // Second delete is a no-op
        archive.delete(&fp).unwrap();
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let (_dir, archive) = archive();
        let fp = fingerprint_bytes(b"never stored");

        let err = archive.read(&fp, false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_read_split_requires_rootfs() {
        let (_dir, archive) = archive();

        let mut meta: &[u8] = b"meta only";
        let (fp, _) = archive.write(&mut meta, None, None).unwrap();

        let err = archive.read(&fp, true).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_entries_lists_blobs() {
        let (_dir, archive) = archive();

        let mut meta: &[u8] = b"meta";
        let mut rootfs: &[u8] = b"rootfs";
        let (fp, _) = archive.write(&mut meta, Some(&mut rootfs), None).unwrap();

        let mut entries = archive.entries().unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![fp.to_string(), format!("{}.rootfs", fp)]
        );
    }
}
