//! Shared-opaque output marking.
//!
//! Files produced inside a shared-opaque directory cannot be attributed to
//! a producer from their location alone, so producers mark each output
//! atomically at exit. Two marking mechanisms exist:
//!
//! - **Timestamp**: the file's modification time is set to a well-known
//!   sentinel. Used on hosts without extended attributes we can rely on.
//! - **Xattr**: an extended attribute with a known name is set to a
//!   non-zero value.
//!
//! A file is considered a shared-opaque output when either mark is present
//! under the host's policy. A file whose hardlink count exceeds the
//! expected count is never marked: an inode shared with the content store
//! (or with a source file) must not be branded as an output, or scrubbing
//! would destroy content that outlives the pip.

use std::path::Path;

use color_eyre::Result;
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use strum::Display as StrumDisplay;
use tracing::{instrument, trace};

use crate::fs;

/// The extended attribute that marks a shared-opaque output.
pub const SHARED_OPAQUE_XATTR: &str = "com.microsoft.buildxl:shared_opaque_output";

/// The sentinel modification time for timestamp-based marking:
/// 2001-09-09T01:46:40Z with a distinctive nanosecond component, a point no
/// legitimate build output lands on by accident.
pub const SENTINEL_MTIME: (i64, u32) = (1_000_000_000, 987_654_321);

/// How shared-opaque outputs are marked on this host.
#[derive(Copy, Clone, Eq, PartialEq, Debug, StrumDisplay, Serialize, Deserialize)]
pub enum MarkPolicy {
    /// Sentinel modification time.
    Timestamp,
    /// Named extended attribute.
    Xattr,
}

impl Default for MarkPolicy {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        {
            MarkPolicy::Xattr
        }
        #[cfg(not(target_os = "linux"))]
        {
            MarkPolicy::Timestamp
        }
    }
}

/// The result of attempting to mark one file.
#[derive(Copy, Clone, Eq, PartialEq, Debug, StrumDisplay)]
pub enum MarkOutcome {
    Marked,
    /// The hardlink-count guard refused the mark: the inode is shared more
    /// widely than a fresh output would be.
    SkippedHardlinkGuard,
}

/// Mark a file as a shared-opaque output.
///
/// `expected_hardlinks` is 2 when the content store keeps a hardlink to
/// ingested outputs, otherwise 1. Symlinks are marked as files (the link
/// itself, never the target) when `follow_symlinks` is false.
#[instrument]
pub async fn mark_output(
    path: &Path,
    policy: MarkPolicy,
    follow_symlinks: bool,
    expected_hardlinks: u64,
) -> Result<MarkOutcome> {
    #[cfg(unix)]
    {
        let links = fs::hardlink_count(path).await?;
        if links > expected_hardlinks {
            trace!(links, expected_hardlinks, "hardlink guard refused mark");
            return Ok(MarkOutcome::SkippedHardlinkGuard);
        }
    }

    match policy {
        MarkPolicy::Timestamp => {
            let (secs, nanos) = SENTINEL_MTIME;
            let sentinel = FileTime::from_unix_time(secs, nanos);
            if follow_symlinks {
                fs::set_mtime(path, sentinel).await?;
            } else {
                fs::set_symlink_mtime(path, sentinel).await?;
            }
            Ok(MarkOutcome::Marked)
        }
        MarkPolicy::Xattr => {
            #[cfg(target_os = "linux")]
            {
                fs::set_xattr(path, SHARED_OPAQUE_XATTR, b"1", follow_symlinks).await?;
                Ok(MarkOutcome::Marked)
            }
            #[cfg(not(target_os = "linux"))]
            {
                let (secs, nanos) = SENTINEL_MTIME;
                fs::set_symlink_mtime(path, FileTime::from_unix_time(secs, nanos)).await?;
                Ok(MarkOutcome::Marked)
            }
        }
    }
}

/// Whether the file carries a shared-opaque output mark under the host
/// policy.
#[instrument]
pub async fn is_marked(path: &Path, policy: MarkPolicy, follow_symlinks: bool) -> Result<bool> {
    match policy {
        MarkPolicy::Timestamp => {
            let mtime = fs::symlink_mtime(path).await?;
            let (secs, nanos) = SENTINEL_MTIME;
            Ok(mtime == FileTime::from_unix_time(secs, nanos))
        }
        MarkPolicy::Xattr => {
            #[cfg(target_os = "linux")]
            {
                let value = fs::get_xattr(path, SHARED_OPAQUE_XATTR, follow_symlinks).await?;
                Ok(value.is_some_and(|v| v.iter().any(|&b| b != 0 && b != b'0')))
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = follow_symlinks;
                let mtime = fs::symlink_mtime(path).await?;
                let (secs, nanos) = SENTINEL_MTIME;
                Ok(mtime == FileTime::from_unix_time(secs, nanos))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[tokio::test]
    async fn timestamp_mark_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("produced");
        fs::write(&path, b"output").await.unwrap();

        assert!(!is_marked(&path, MarkPolicy::Timestamp, false).await.unwrap());
        let outcome = mark_output(&path, MarkPolicy::Timestamp, false, 1)
            .await
            .unwrap();
        pretty_assert_eq!(outcome, MarkOutcome::Marked);
        assert!(is_marked(&path, MarkPolicy::Timestamp, false).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hardlink_guard_refuses_shared_inodes() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("source");
        let link = dir.path().join("link");
        fs::write(&original, b"shared").await.unwrap();
        fs::hard_link(&original, &link).await.unwrap();

        // Two links but only one expected: this inode predates the pip.
        let outcome = mark_output(&link, MarkPolicy::Timestamp, false, 1)
            .await
            .unwrap();
        pretty_assert_eq!(outcome, MarkOutcome::SkippedHardlinkGuard);
        assert!(!is_marked(&link, MarkPolicy::Timestamp, false).await.unwrap());

        // With the store hardlink accounted for, the mark proceeds.
        let outcome = mark_output(&link, MarkPolicy::Timestamp, false, 2)
            .await
            .unwrap();
        pretty_assert_eq!(outcome, MarkOutcome::Marked);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_marked_as_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        fs::write(&target, b"t").await.unwrap();
        tokio::fs::symlink(&target, &link).await.unwrap();

        // Timestamp-marking the target leaves the link unmarked under
        // no-follow detection.
        mark_output(&target, MarkPolicy::Timestamp, false, 1)
            .await
            .unwrap();
        assert!(!is_marked(&link, MarkPolicy::Timestamp, false).await.unwrap());
        assert!(is_marked(&target, MarkPolicy::Timestamp, false).await.unwrap());
    }
}
