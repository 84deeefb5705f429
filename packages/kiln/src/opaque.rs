//! Shared-opaque output tracking and scrubbing.
//!
//! Shared-opaque directories accept writes from many pips, so their
//! contents cannot be declared statically. Producers mark every file they
//! create there (see [`crate::sandbox::opaque`]) and append it to a sideband
//! log (see [`crate::sideband`]). At build start, the tracker scrubs every
//! *marked* file under the declared roots that no sideband log claims, so
//! stale outputs of abandoned pips never leak into the new build.
//!
//! Scrubbing rules:
//! - only marked files are candidates; unmarked files are someone else's;
//! - directories are never deleted just because they became empty;
//! - symlinks are treated as files (the link is scrubbed, not the target);
//! - the hardlink guard applies: an inode with more links than a fresh
//!   output would have is left alone.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::Context};
use tokio::task::spawn_blocking;
use tracing::{debug, instrument, trace, warn};

use crate::{
    fs,
    pip::SemiStableHash,
    sandbox::opaque::{MarkOutcome, MarkPolicy, is_marked, mark_output},
    sideband::{SidebandMetadata, SidebandWriter, read_sideband},
};

/// Tracks shared-opaque outputs across the produce/scrub lifecycle.
#[derive(Clone, Debug)]
pub struct SharedOpaqueTracker {
    /// Where per-pip sideband logs live.
    sideband_dir: PathBuf,
    /// Identity recorded into sideband metadata.
    producer: String,
    mark_policy: MarkPolicy,
    follow_symlinks: bool,
    expected_hardlinks: u64,
}

/// What one scrub pass did.
#[derive(Clone, Debug, Default)]
pub struct ScrubSummary {
    pub examined: usize,
    pub scrubbed: Vec<PathBuf>,
    pub retained: usize,
}

impl SharedOpaqueTracker {
    pub fn new(
        sideband_dir: impl Into<PathBuf>,
        producer: impl Into<String>,
        mark_policy: MarkPolicy,
        follow_symlinks: bool,
        cas_keeps_hardlink: bool,
    ) -> Self {
        Self {
            sideband_dir: sideband_dir.into(),
            producer: producer.into(),
            mark_policy,
            follow_symlinks,
            expected_hardlinks: if cas_keeps_hardlink { 2 } else { 1 },
        }
    }

    /// Record and mark the files a pip produced under shared-opaque roots.
    ///
    /// Called at pip completion, after outputs are ingested into the content
    /// store (so the hardlink guard sees the final link count).
    #[instrument(skip(self, produced))]
    pub async fn record_outputs(
        &self,
        pip: SemiStableHash,
        roots: &[PathBuf],
        produced: impl IntoIterator<Item = &Path>,
    ) -> Result<()> {
        let metadata = SidebandMetadata {
            pip,
            producer: self.producer.clone(),
        };
        let sideband_path = self.sideband_dir.join(format!("{pip}.sideband"));
        let mut writer =
            SidebandWriter::create(&sideband_path, &metadata, roots.to_vec()).await?;

        for path in produced {
            if !writer.record(path).await? {
                continue;
            }
            let outcome = mark_output(
                path,
                self.mark_policy,
                self.follow_symlinks,
                self.expected_hardlinks,
            )
            .await?;
            if outcome == MarkOutcome::SkippedHardlinkGuard {
                trace!(?path, "output left unmarked by hardlink guard");
            }
        }
        writer.flush().await
    }

    /// Read every sideband log and return the set of claimed paths.
    ///
    /// Unreadable logs are skipped with a warning: a missing claim means the
    /// file gets scrubbed and rebuilt, which is always safe.
    #[instrument(skip(self))]
    pub async fn claimed_paths(&self) -> Result<BTreeSet<String>> {
        let mut claimed = BTreeSet::new();
        if !fs::is_dir(&self.sideband_dir).await {
            return Ok(claimed);
        }

        for (name, is_dir) in fs::enumerate_sorted(&self.sideband_dir).await? {
            if is_dir || !name.ends_with(".sideband") {
                continue;
            }
            let path = self.sideband_dir.join(&name);
            match read_sideband(&path).await {
                Ok(log) => claimed.extend(log.paths),
                Err(err) => warn!(?path, ?err, "skipping unreadable sideband log"),
            }
        }
        Ok(claimed)
    }

    /// Scrub stale shared-opaque outputs under the declared roots.
    ///
    /// Holds the store lock for the duration: a scrub interleaved with a
    /// sibling engine's marking pass would read the sibling's fresh
    /// outputs as stale.
    #[instrument(skip(self, roots))]
    pub async fn scrub(&self, roots: &[PathBuf]) -> Result<ScrubSummary> {
        let _lock = fs::StoreLock::at(self.sideband_dir.join("scrub.lock"))
            .hold()
            .await?;

        let claimed = self.claimed_paths().await?;
        let mut summary = ScrubSummary::default();

        for root in roots {
            if !fs::is_dir(root).await {
                continue;
            }
            let candidates = walk_files(root.clone()).await?;
            for path in candidates {
                summary.examined += 1;

                if claimed.contains(&path.to_string_lossy().into_owned()) {
                    summary.retained += 1;
                    continue;
                }
                if !is_marked(&path, self.mark_policy, self.follow_symlinks).await? {
                    summary.retained += 1;
                    continue;
                }
                #[cfg(unix)]
                {
                    if fs::hardlink_count(&path).await? > self.expected_hardlinks {
                        summary.retained += 1;
                        continue;
                    }
                }

                trace!(?path, "scrubbing stale shared-opaque output");
                fs::remove_file_if_exists(&path).await?;
                summary.scrubbed.push(path);
            }
        }

        debug!(
            examined = summary.examined,
            scrubbed = summary.scrubbed.len(),
            retained = summary.retained,
            "scrub pass complete"
        );
        Ok(summary)
    }
}

/// Every file and symlink under the root, recursively. Directories are
/// traversed but never returned; symlinks are not followed.
async fn walk_files(root: PathBuf) -> Result<Vec<PathBuf>> {
    spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&root).follow_links(false) {
            let entry = entry.with_context(|| format!("walk {root:?}"))?;
            let kind = entry.file_type();
            if kind.is_file() || kind.is_symlink() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    })
    .await
    .context("join task")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn tracker(dir: &Path) -> SharedOpaqueTracker {
        SharedOpaqueTracker::new(
            dir.join("sideband"),
            "test-producer",
            MarkPolicy::Timestamp,
            false,
            false,
        )
    }

    #[tokio::test]
    async fn scrub_removes_marked_unclaimed_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("so");
        let tracker = tracker(dir.path());

        // A stale output of a previous build: marked, but claimed by no
        // sideband log.
        let stale = root.join("stale.o");
        fs::write(&stale, b"old").await.unwrap();
        mark_output(&stale, MarkPolicy::Timestamp, false, 1).await.unwrap();

        // A user file: unmarked.
        let foreign = root.join("README");
        fs::write(&foreign, b"keep me").await.unwrap();

        let summary = tracker.scrub(&[root.clone()]).await.unwrap();
        pretty_assert_eq!(summary.scrubbed, vec![stale.clone()]);
        assert!(!fs::exists(&stale).await);
        assert!(fs::exists(&foreign).await);
    }

    #[tokio::test]
    async fn claimed_outputs_survive_scrub() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("so");
        let tracker = tracker(dir.path());

        let produced = root.join("fresh.o");
        fs::write(&produced, b"new").await.unwrap();
        tracker
            .record_outputs(
                SemiStableHash(7),
                &[root.clone()],
                [produced.as_path()],
            )
            .await
            .unwrap();

        assert!(is_marked(&produced, MarkPolicy::Timestamp, false).await.unwrap());

        let summary = tracker.scrub(&[root.clone()]).await.unwrap();
        assert!(summary.scrubbed.is_empty());
        assert!(fs::exists(&produced).await);
    }

    #[tokio::test]
    async fn empty_directories_are_never_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("so");
        let nested = root.join("only-dir");
        fs::create_dir_all(&nested).await.unwrap();

        let tracker = tracker(dir.path());
        let summary = tracker.scrub(&[root.clone()]).await.unwrap();
        pretty_assert_eq!(summary.scrubbed.len(), 0);
        assert!(fs::is_dir(&nested).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hardlinked_files_are_retained() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("so");
        let tracker = tracker(dir.path());

        let shared = root.join("shared");
        let alias = dir.path().join("alias");
        fs::write(&shared, b"inode").await.unwrap();
        // Mark first, then link: the mark was legitimate at produce time,
        // but by scrub time the inode has more links than an output should.
        mark_output(&shared, MarkPolicy::Timestamp, false, 1).await.unwrap();
        fs::hard_link(&shared, &alias).await.unwrap();

        let summary = tracker.scrub(&[root.clone()]).await.unwrap();
        assert!(summary.scrubbed.is_empty());
        assert!(fs::exists(&shared).await);
    }
}
