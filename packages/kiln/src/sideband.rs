//! Sideband logs: append-only shared-opaque provenance.
//!
//! Each pip that writes into a shared-opaque directory appends the paths it
//! produced to a per-pip sideband file. The scrubber reads these files at
//! the start of the next build to decide what is a stale output and what is
//! not. The format is deliberately dumb:
//!
//! - fixed header: magic bytes, version, and an rmp-encoded
//!   [`SidebandMetadata`] (length-prefixed);
//! - records: length-prefixed UTF-8 paths.
//!
//! Writers deduplicate in memory, so a path appears at most once per file.
//! Readers tolerate truncated tails: a crash mid-append loses at most the
//! record being written, never the records before it.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, trace, warn};

use crate::pip::SemiStableHash;

/// Magic bytes opening every sideband file.
pub const MAGIC: &[u8; 6] = b"KLNSB1";

/// Current format version.
pub const VERSION: u32 = 1;

/// Who produced this sideband file.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct SidebandMetadata {
    pub pip: SemiStableHash,
    /// Identity of the producing engine instance (machine, session).
    pub producer: String,
}

/// An open sideband file being appended to.
pub struct SidebandWriter {
    file: tokio::fs::File,
    path: PathBuf,
    seen: BTreeSet<String>,
    /// When non-empty, only paths under one of these roots are recorded.
    roots: Vec<PathBuf>,
}

impl SidebandWriter {
    /// Create a sideband file, writing the header immediately.
    #[instrument(skip(metadata))]
    pub async fn create(
        path: impl Into<PathBuf> + std::fmt::Debug,
        metadata: &SidebandMetadata,
        roots: Vec<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            crate::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("create sideband file {path:?}"))?;

        let metadata_bytes = rmp_serde::to_vec(metadata).context("encode sideband metadata")?;
        let mut header = Vec::with_capacity(MAGIC.len() + 8 + metadata_bytes.len());
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&VERSION.to_le_bytes());
        header.extend_from_slice(&(metadata_bytes.len() as u32).to_le_bytes());
        header.extend_from_slice(&metadata_bytes);
        file.write_all(&header).await.context("write header")?;

        Ok(Self {
            file,
            path,
            seen: BTreeSet::new(),
            roots,
        })
    }

    /// Record one produced path.
    ///
    /// Returns `false` without writing when the path was already recorded or
    /// falls outside the root filter.
    #[instrument(skip(self))]
    pub async fn record(&mut self, path: &Path) -> Result<bool> {
        if !self.roots.is_empty() && !self.roots.iter().any(|root| path.starts_with(root)) {
            trace!(?path, "outside sideband roots, not recorded");
            return Ok(false);
        }

        let rendered = path.to_string_lossy().into_owned();
        if !self.seen.insert(rendered.clone()) {
            return Ok(false);
        }

        let bytes = rendered.as_bytes();
        let mut record = Vec::with_capacity(4 + bytes.len());
        record.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        record.extend_from_slice(bytes);
        self.file
            .write_all(&record)
            .await
            .with_context(|| format!("append to sideband file {:?}", self.path))?;
        Ok(true)
    }

    /// Flush buffered records to disk.
    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await.context("flush sideband file")
    }
}

/// A parsed sideband file.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SidebandLog {
    pub metadata: SidebandMetadata,
    pub paths: Vec<String>,
    /// Whether reading stopped early at an unreadable record.
    pub truncated: bool,
}

/// Read a sideband file, tolerating a torn tail.
///
/// A corrupt header is an error; a corrupt or truncated *record* ends the
/// read and returns everything before it.
#[instrument]
pub async fn read_sideband(path: impl AsRef<Path> + std::fmt::Debug) -> Result<SidebandLog> {
    let path = path.as_ref();
    let buffer = crate::fs::must_read_buffered(path).await?;

    fn take<'a>(buffer: &'a [u8], cursor: &mut usize, len: usize) -> Option<&'a [u8]> {
        let slice = buffer.get(*cursor..cursor.checked_add(len)?)?;
        *cursor += len;
        Some(slice)
    }

    let mut cursor = 0usize;
    let Some(magic) = take(&buffer, &mut cursor, MAGIC.len()) else {
        bail!("sideband file too short for magic: {path:?}");
    };
    if magic != MAGIC {
        bail!("bad sideband magic in {path:?}");
    }

    let Some(version_bytes) = take(&buffer, &mut cursor, 4) else {
        bail!("sideband file too short for version: {path:?}");
    };
    let version = u32::from_le_bytes(version_bytes.try_into().expect("4 bytes"));
    if version != VERSION {
        bail!("unsupported sideband version {version} in {path:?}");
    }

    let Some(metadata_len) = take(&buffer, &mut cursor, 4) else {
        bail!("sideband file too short for metadata length: {path:?}");
    };
    let metadata_len = u32::from_le_bytes(metadata_len.try_into().expect("4 bytes")) as usize;
    let Some(metadata_bytes) = take(&buffer, &mut cursor, metadata_len) else {
        bail!("sideband file too short for metadata: {path:?}");
    };
    let metadata: SidebandMetadata =
        rmp_serde::from_slice(metadata_bytes).context("decode sideband metadata")?;

    let mut paths = Vec::new();
    let mut truncated = false;
    loop {
        let Some(len_bytes) = take(&buffer, &mut cursor, 4) else {
            // Clean EOF or torn length prefix; either way we are done.
            truncated = cursor < buffer.len();
            break;
        };
        let len = u32::from_le_bytes(len_bytes.try_into().expect("4 bytes")) as usize;
        let Some(record) = take(&buffer, &mut cursor, len) else {
            truncated = true;
            break;
        };
        match std::str::from_utf8(record) {
            Ok(rendered) => paths.push(rendered.to_string()),
            Err(_) => {
                truncated = true;
                break;
            }
        }
    }

    if truncated {
        warn!(?path, records = paths.len(), "sideband file has a torn tail");
    }
    debug!(?path, records = paths.len(), "read sideband file");
    Ok(SidebandLog {
        metadata,
        paths,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn metadata() -> SidebandMetadata {
        SidebandMetadata {
            pip: SemiStableHash(0xABCD),
            producer: "machine-a/session-1".into(),
        }
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pip.sideband");

        let mut writer = SidebandWriter::create(&path, &metadata(), vec![]).await.unwrap();
        for p in ["/so/a", "/so/b", "/so/c"] {
            assert!(writer.record(Path::new(p)).await.unwrap());
        }
        writer.flush().await.unwrap();

        let log = read_sideband(&path).await.unwrap();
        pretty_assert_eq!(log.metadata, metadata());
        pretty_assert_eq!(log.paths, vec!["/so/a", "/so/b", "/so/c"]);
        assert!(!log.truncated);
    }

    #[tokio::test]
    async fn records_deduplicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pip.sideband");

        let mut writer = SidebandWriter::create(&path, &metadata(), vec![]).await.unwrap();
        assert!(writer.record(Path::new("/so/a")).await.unwrap());
        assert!(!writer.record(Path::new("/so/a")).await.unwrap());
        writer.flush().await.unwrap();

        let log = read_sideband(&path).await.unwrap();
        pretty_assert_eq!(log.paths, vec!["/so/a"]);
    }

    #[tokio::test]
    async fn root_filter_drops_outsiders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pip.sideband");

        let mut writer =
            SidebandWriter::create(&path, &metadata(), vec![PathBuf::from("/so")])
                .await
                .unwrap();
        assert!(writer.record(Path::new("/so/a")).await.unwrap());
        assert!(!writer.record(Path::new("/elsewhere/b")).await.unwrap());
        writer.flush().await.unwrap();

        let log = read_sideband(&path).await.unwrap();
        pretty_assert_eq!(log.paths, vec!["/so/a"]);
    }

    #[tokio::test]
    async fn torn_tail_returns_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pip.sideband");

        let mut writer = SidebandWriter::create(&path, &metadata(), vec![]).await.unwrap();
        for p in ["/so/a", "/so/b", "/so/c"] {
            writer.record(Path::new(p)).await.unwrap();
        }
        writer.flush().await.unwrap();
        drop(writer);

        // Simulate a crash mid-append: a length prefix promising more bytes
        // than exist.
        let mut bytes = crate::fs::must_read_buffered(&path).await.unwrap();
        bytes.extend_from_slice(&(100u32).to_le_bytes());
        bytes.extend_from_slice(b"/so/partial");
        crate::fs::write(&path, &bytes).await.unwrap();

        let log = read_sideband(&path).await.unwrap();
        pretty_assert_eq!(log.paths, vec!["/so/a", "/so/b", "/so/c"]);
        assert!(log.truncated);
    }

    #[tokio::test]
    async fn bad_magic_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage");
        crate::fs::write(&path, b"not a sideband file").await.unwrap();
        assert!(read_sideband(&path).await.is_err());
    }
}
