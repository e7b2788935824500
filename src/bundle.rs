//! Bundle archives.
//!
//! A bundle is a zip archive of application code. It is loaded into memory
//! once per deploy (bounded by [`MAX_BUNDLE_SIZE`]), fingerprinted with
//! SHA-256, and extracted into the container's application directory through
//! a host mount.
//!
//! ## Security
//!
//! - Entries with absolute paths or `..` components are rejected with
//!   [`Error::PathTraversal`] before anything is written.
//! - Entry count and total uncompressed size are bounded
//!   ([`MAX_BUNDLE_ENTRIES`], [`MAX_EXTRACTED_SIZE`]); the size bound is
//!   enforced on bytes actually written, not on the sizes the archive claims.

use std::fs;
use std::io::{self, Cursor, Read, Seek};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::debug;
use zip::ZipArchive;

use crate::constants::{MAX_BUNDLE_ENTRIES, MAX_BUNDLE_SIZE, MAX_EXTRACTED_SIZE};
use crate::error::{Error, Result};

/// Where a bundle archive comes from.
#[derive(Debug, Clone)]
pub enum BundleSource {
    /// Zip file on the host.
    Path(PathBuf),
    /// Zip archive already in memory (e.g. an HTTP upload).
    Bytes(Bytes),
}

impl From<PathBuf> for BundleSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Bytes> for BundleSource {
    fn from(data: Bytes) -> Self {
        Self::Bytes(data)
    }
}

/// A validated bundle archive held in memory.
#[derive(Debug, Clone)]
pub struct BundleArchive {
    data: Bytes,
    digest: String,
    entries: usize,
}

impl BundleArchive {
    /// Loads and validates an archive from any source.
    pub async fn load(source: &BundleSource) -> Result<Self> {
        match source {
            BundleSource::Bytes(data) => Self::from_bytes(data.clone()),
            BundleSource::Path(path) => Self::open(path).await,
        }
    }

    /// Reads an archive from disk.
    pub async fn open(path: &Path) -> Result<Self> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| Error::MissingFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if meta.len() > MAX_BUNDLE_SIZE {
            return Err(Error::Archive(format!(
                "archive is {} bytes, limit is {MAX_BUNDLE_SIZE}",
                meta.len()
            )));
        }
        let data = tokio::fs::read(path).await?;
        Self::from_bytes(Bytes::from(data))
    }

    /// Validates an in-memory archive: size limit, readable central
    /// directory, entry limit.
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.len() as u64 > MAX_BUNDLE_SIZE {
            return Err(Error::Archive(format!(
                "archive is {} bytes, limit is {MAX_BUNDLE_SIZE}",
                data.len()
            )));
        }
        let archive = ZipArchive::new(Cursor::new(data.clone()))?;
        let entries = archive.len();
        if entries > MAX_BUNDLE_ENTRIES {
            return Err(Error::Archive(format!(
                "archive has {entries} entries, limit is {MAX_BUNDLE_ENTRIES}"
            )));
        }
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&data)));
        Ok(Self {
            data,
            digest,
            entries,
        })
    }

    /// `sha256:<hex>` of the archive bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Extracts the archive under `dest` on the blocking pool.
    pub async fn extract_to(&self, dest: PathBuf) -> Result<ExtractStats> {
        let data = self.data.clone();
        tokio::task::spawn_blocking(move || extract_archive(Cursor::new(data), &dest))
            .await
            .map_err(|e| Error::Internal(format!("extraction task failed: {e}")))?
    }
}

/// What an extraction wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub files: usize,
    pub dirs: usize,
    pub bytes: u64,
}

/// Extracts a zip archive into `dest`, which must already exist.
pub fn extract_archive<R: Read + Seek>(reader: R, dest: &Path) -> Result<ExtractStats> {
    let mut archive = ZipArchive::new(reader)?;
    if archive.len() > MAX_BUNDLE_ENTRIES {
        return Err(Error::Archive(format!(
            "archive has {} entries, limit is {MAX_BUNDLE_ENTRIES}",
            archive.len()
        )));
    }

    let mut stats = ExtractStats::default();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();

        // SECURITY: reject anything that could land outside `dest`
        let relative = entry
            .enclosed_name()
            .filter(|p| !p.components().any(|c| matches!(c, Component::ParentDir)))
            .ok_or_else(|| Error::PathTraversal { path: name.clone() })?;
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            stats.dirs += 1;
            continue;
        }

        if stats.bytes.saturating_add(entry.size()) > MAX_EXTRACTED_SIZE {
            return Err(Error::Archive(format!(
                "uncompressed size exceeds {MAX_EXTRACTED_SIZE} bytes"
            )));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)?;
        let budget = MAX_EXTRACTED_SIZE - stats.bytes;
        let written = io::copy(&mut (&mut entry).take(budget + 1), &mut out)?;
        stats.bytes += written;
        if stats.bytes > MAX_EXTRACTED_SIZE {
            return Err(Error::Archive(format!(
                "uncompressed size exceeds {MAX_EXTRACTED_SIZE} bytes"
            )));
        }

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
        }

        debug!(path = %relative.display(), bytes = written, "Extracted bundle entry");
        stats.files += 1;
    }

    Ok(stats)
}
