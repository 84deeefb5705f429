//! The local content-addressed store.
//!
//! A flat, dumb blob store: each blob lives in a file named by the hex
//! digest of its content, under a two-level prefix directory
//! (`{root}/{hex[0..2]}/{hex[2..4]}/{hex}`). Blobs are stored uncompressed
//! so that placement can hardlink straight out of the store; compression
//! happens on the wire (see [`crate::cas::remote`]), not at rest.
//!
//! Writes are atomic (temp file then rename) and verified: content is
//! re-hashed on the way in unless the caller vouches for the hash via the
//! trusted fast path, and a mismatch fails the write.

use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::{Debug, Display};
use tokio::io::{AsyncRead, BufReader};
use tracing::{instrument, trace, warn};

use wire::{ContentHash, LOCAL_BUFFER_SIZE};

use crate::fs;

/// Local content-addressed storage backed by the filesystem.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[debug("LocalCas(root = {})", self.root.display())]
#[display("{}", root.display())]
pub struct LocalCas {
    root: PathBuf,
}

/// How content enters the store from a file.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum IngestMode {
    /// Copy the bytes in, leaving the source untouched.
    Copy,
    /// Hardlink the source into the store when possible, falling back to a
    /// copy across filesystems.
    Hardlink,
}

impl LocalCas {
    /// Create an instance rooted at the given directory. The directory is
    /// created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The path a blob with this hash lives at.
    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.digest_hex();
        self.root
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex)
    }

    /// Whether the blob exists locally.
    #[instrument(name = "LocalCas::contains")]
    pub async fn contains(&self, hash: &ContentHash) -> bool {
        fs::is_file(self.blob_path(hash)).await
    }

    /// Store a buffer under its hash.
    ///
    /// Returns `true` when the blob was newly written.
    #[instrument(name = "LocalCas::write", skip(content))]
    pub async fn write(&self, hash: &ContentHash, content: &[u8]) -> Result<bool> {
        let actual = ContentHash::from_buffer(content);
        if actual != *hash {
            bail!("checksum mismatch ingesting buffer: {actual} != {hash}");
        }
        self.write_trusted(hash, content).await
    }

    /// Store a buffer whose hash the caller vouches for.
    #[instrument(name = "LocalCas::write_trusted", skip(content))]
    pub async fn write_trusted(&self, hash: &ContentHash, content: &[u8]) -> Result<bool> {
        let path = self.blob_path(hash);
        if fs::is_file(&path).await {
            return Ok(false);
        }
        fs::write_atomic(&path, content).await?;
        trace!(%hash, bytes = content.len(), "stored blob");
        Ok(true)
    }

    /// Ingest a file from disk, hashing it on the way in.
    ///
    /// Returns the hash, the byte length, and whether the blob was newly
    /// stored.
    #[instrument(name = "LocalCas::ingest_file")]
    pub async fn ingest_file(
        &self,
        source: &Path,
        mode: IngestMode,
    ) -> Result<(ContentHash, u64, bool)> {
        let (hash, len) = fs::hash_file(source).await?;
        let new = self.ingest_file_trusted(source, &hash, mode).await?;
        Ok((hash, len, new))
    }

    /// Ingest a file whose hash the caller vouches for (the trusted-copy
    /// fast path). The bytes are not re-hashed.
    #[instrument(name = "LocalCas::ingest_file_trusted")]
    pub async fn ingest_file_trusted(
        &self,
        source: &Path,
        hash: &ContentHash,
        mode: IngestMode,
    ) -> Result<bool> {
        let path = self.blob_path(hash);
        if fs::is_file(&path).await {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        match mode {
            IngestMode::Hardlink => {
                if let Err(err) = fs::hard_link(source, &path).await {
                    trace!(?err, "hardlink ingest failed, copying instead");
                    let temp = fs::temp_sibling(&path);
                    fs::copy(source, &temp).await?;
                    fs::rename(&temp, &path).await?;
                }
            }
            IngestMode::Copy => {
                let temp = fs::temp_sibling(&path);
                fs::copy(source, &temp).await?;
                fs::rename(&temp, &path).await?;
            }
        }
        trace!(%hash, ?source, "ingested file");
        Ok(true)
    }

    /// Open a blob for streaming reads, or `None` if absent.
    #[instrument(name = "LocalCas::reader")]
    pub async fn reader(
        &self,
        hash: &ContentHash,
    ) -> Result<Option<impl AsyncRead + Unpin + 'static>> {
        let path = self.blob_path(hash);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Some(BufReader::with_capacity(LOCAL_BUFFER_SIZE, file))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("open blob {path:?}")),
        }
    }

    /// Read a whole blob, or `None` if absent.
    #[instrument(name = "LocalCas::read_buffered")]
    pub async fn read_buffered(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        fs::read_buffered(self.blob_path(hash)).await
    }

    /// Hardlink the stored blob to `dst`.
    #[instrument(name = "LocalCas::link_to")]
    pub async fn link_to(&self, hash: &ContentHash, dst: &Path) -> Result<()> {
        fs::hard_link(self.blob_path(hash), dst).await
    }

    /// Copy the stored blob to `dst`.
    #[instrument(name = "LocalCas::copy_to")]
    pub async fn copy_to(&self, hash: &ContentHash, dst: &Path) -> Result<u64> {
        fs::copy(self.blob_path(hash), dst).await
    }

    /// Move the stored blob to `dst`, evicting it from the store.
    #[instrument(name = "LocalCas::move_to")]
    pub async fn move_to(&self, hash: &ContentHash, dst: &Path) -> Result<()> {
        let src = self.blob_path(hash);
        if let Err(err) = fs::rename(&src, dst).await {
            trace!(?err, "rename failed, copying then removing");
            fs::copy(&src, dst).await?;
            fs::remove_file_if_exists(&src).await?;
        }
        Ok(())
    }

    /// Remove a blob, returning whether it existed.
    #[instrument(name = "LocalCas::remove")]
    pub async fn remove(&self, hash: &ContentHash) -> Result<bool> {
        fs::remove_file_if_exists(self.blob_path(hash)).await
    }

    /// Re-hash a stored blob and compare to its name.
    ///
    /// A mismatch removes the corrupt blob and reports `false`.
    #[instrument(name = "LocalCas::verify_local")]
    pub async fn verify_local(&self, hash: &ContentHash) -> Result<bool> {
        let path = self.blob_path(hash);
        if !fs::is_file(&path).await {
            return Ok(false);
        }
        let (actual, _) = fs::hash_file(&path).await?;
        if actual != *hash {
            warn!(%hash, %actual, "corrupt blob, removing");
            fs::remove_file_if_exists(&path).await?;
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[tokio::test]
    async fn buffer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::new(dir.path());

        let content = b"hello world";
        let hash = ContentHash::from_buffer(content);

        pretty_assert_eq!(cas.write(&hash, content).await.unwrap(), true);
        pretty_assert_eq!(cas.write(&hash, content).await.unwrap(), false);
        pretty_assert_eq!(
            cas.read_buffered(&hash).await.unwrap().unwrap(),
            content.to_vec()
        );
    }

    #[tokio::test]
    async fn write_rejects_wrong_hash() {
        let dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::new(dir.path());
        let wrong = ContentHash::from_buffer(b"other");
        assert!(cas.write(&wrong, b"content").await.is_err());
    }

    #[tokio::test]
    async fn ingest_and_link_out() {
        let dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::new(dir.path().join("cas"));

        let source = dir.path().join("source.txt");
        fs::write(&source, b"artifact").await.unwrap();

        let (hash, len, new) = cas.ingest_file(&source, IngestMode::Hardlink).await.unwrap();
        pretty_assert_eq!(len, 8);
        assert!(new);
        assert!(cas.contains(&hash).await);

        let out = dir.path().join("placed.txt");
        cas.link_to(&hash, &out).await.unwrap();
        pretty_assert_eq!(fs::must_read_buffered(&out).await.unwrap(), b"artifact");
    }

    #[tokio::test]
    async fn verify_removes_corrupt_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::new(dir.path());

        let content = b"valid";
        let hash = ContentHash::from_buffer(content);
        cas.write(&hash, content).await.unwrap();
        assert!(cas.verify_local(&hash).await.unwrap());

        // Corrupt the blob in place.
        fs::write(cas.blob_path(&hash), b"tampered").await.unwrap();
        assert!(!cas.verify_local(&hash).await.unwrap());
        assert!(!cas.contains(&hash).await);
    }

    #[tokio::test]
    async fn move_evicts_the_blob() {
        let dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::new(dir.path().join("cas"));

        let content = b"movable";
        let hash = ContentHash::from_buffer(content);
        cas.write(&hash, content).await.unwrap();

        let out = dir.path().join("moved");
        cas.move_to(&hash, &out).await.unwrap();
        assert!(!cas.contains(&hash).await);
        pretty_assert_eq!(fs::must_read_buffered(&out).await.unwrap(), b"movable");
    }
}
