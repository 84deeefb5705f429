//! Filesystem operations tailored to `kiln`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using. Everything
//! else in the crate goes through this module so that blocking work is
//! consistently pushed onto the blocking pool and errors consistently carry
//! the path they failed on.

#![allow(
    clippy::disallowed_methods,
    reason = "The methods are disallowed elsewhere, but we need them here!"
)]

use std::{
    fmt::Debug as StdDebug,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt, bail},
};
use filetime::FileTime;
use fslock::LockFile as FsLockFile;
use tap::{Pipe, TapFallible};
use tokio::{io::AsyncWriteExt, task::spawn_blocking};
use tracing::{debug, instrument, trace, warn};

use wire::{ContentHash, LOCAL_BUFFER_SIZE};

/// Cross-process exclusion around store-wide filesystem passes.
///
/// Several engines can share one store root, and some passes must not
/// interleave: a scrub running while a sibling engine is still marking its
/// fresh shared-opaque outputs would read those outputs as stale and
/// delete them. The lock is a plain lockfile next to the guarded state;
/// [`StoreLock::hold`] waits out whichever process holds it and returns a
/// guard that releases on drop, so an early error path can never leave the
/// store locked.
#[derive(Clone, Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    /// A lock at the given path. Nothing touches the filesystem until
    /// [`StoreLock::hold`].
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Take the lock, waiting (on the blocking pool) for any peer process
    /// that currently holds it.
    #[instrument(name = "StoreLock::hold", skip(self), fields(path = ?self.path))]
    pub async fn hold(&self) -> Result<StoreLockGuard> {
        let path = self.path.clone();
        let file = spawn_blocking(move || -> Result<FsLockFile> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create lock directory {parent:?}"))?;
            }
            let mut file = FsLockFile::open(path.as_path())
                .with_context(|| format!("open store lock {path:?}"))?;
            file.lock()
                .with_context(|| format!("take store lock {path:?}"))?;
            Ok(file)
        })
        .await
        .context("join task")??;

        trace!("store lock held");
        Ok(StoreLockGuard {
            path: self.path.clone(),
            _file: file,
        })
    }
}

/// Exclusive hold on a [`StoreLock`]; dropping it releases the lockfile.
pub struct StoreLockGuard {
    path: PathBuf,
    _file: FsLockFile,
}

impl Drop for StoreLockGuard {
    fn drop(&mut self) {
        trace!(path = ?self.path, "store lock released");
    }
}

/// Determine the canonical store path for the current user, if possible.
///
/// - Linux: `$XDG_CACHE_HOME/kiln/v1`
/// - macOS: `$HOME/Library/Caches/com.kiln.engine/v1`
/// - Windows: `%LOCALAPPDATA%\kiln\v1`
///
/// Falls back to `$HOME/.cache/kiln/v1` if the conventional directories
/// cannot be determined.
#[instrument]
pub async fn user_global_store_path() -> Result<PathBuf> {
    let dirs = spawn_blocking(|| directories::ProjectDirs::from("com", "kiln", "kiln"))
        .await
        .context("join task")?;

    let base = if let Some(dirs) = dirs {
        dirs.cache_dir().to_path_buf()
    } else {
        homedir::my_home()
            .context("get user home directory")?
            .ok_or_eyre("user has no home directory")?
            .join(".cache")
            .join("kiln")
    };

    base.join("v1")
        .pipe(Ok)
        .tap_ok(|dir: &PathBuf| debug!(?dir, "user global store path"))
}

/// Create a directory and all of its parents.
#[instrument]
pub async fn create_dir_all(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("create directory {path:?}"))
}

/// Write the buffer to the file, creating parent directories as needed.
#[instrument(skip(content))]
pub async fn write(path: impl AsRef<Path> + StdDebug, content: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create parent directory {parent:?}"))?;
    }
    tokio::fs::write(path, content.as_ref())
        .await
        .with_context(|| format!("write file {path:?}"))
}

/// Write the buffer through a temporary sibling, then atomically rename it
/// into place. Readers never observe a partially written file.
#[instrument(skip(content))]
pub async fn write_atomic(
    path: impl AsRef<Path> + StdDebug,
    content: impl AsRef<[u8]>,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create parent directory {parent:?}"))?;
    }

    let temp = temp_sibling(path);
    let mut file = tokio::fs::File::create(&temp)
        .await
        .with_context(|| format!("create temporary file {temp:?}"))?;
    file.write_all(content.as_ref())
        .await
        .with_context(|| format!("write temporary file {temp:?}"))?;
    file.flush().await.context("flush temporary file")?;
    drop(file);

    match tokio::fs::rename(&temp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Err(err) = tokio::fs::remove_file(&temp).await {
                warn!(?temp, ?err, "failed to remove temporary file");
            }
            Err(err).with_context(|| format!("rename {temp:?} to {path:?}"))
        }
    }
}

/// Generate a temporary file path in the same directory as the target.
pub fn temp_sibling(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(uuid::Uuid::new_v4().to_string());
    PathBuf::from(temp)
}

/// Read the entire file, or `None` if it does not exist.
#[instrument]
pub async fn read_buffered(path: impl AsRef<Path> + StdDebug) -> Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read file {path:?}")),
    }
}

/// Read the entire file; error if it does not exist.
#[instrument]
pub async fn must_read_buffered(path: impl AsRef<Path> + StdDebug) -> Result<Vec<u8>> {
    let path = path.as_ref();
    read_buffered(path)
        .await?
        .ok_or_eyre(format!("file not found: {path:?}"))
}

/// Whether anything exists at the path.
pub async fn exists(path: impl AsRef<Path>) -> bool {
    tokio::fs::symlink_metadata(path.as_ref()).await.is_ok()
}

/// Whether a regular file exists at the path.
pub async fn is_file(path: impl AsRef<Path>) -> bool {
    tokio::fs::metadata(path.as_ref())
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Whether a directory exists at the path.
pub async fn is_dir(path: impl AsRef<Path>) -> bool {
    tokio::fs::metadata(path.as_ref())
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Remove the file if it exists.
#[instrument]
pub async fn remove_file_if_exists(path: impl AsRef<Path> + StdDebug) -> Result<bool> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove file {path:?}")),
    }
}

/// Create a hard link at `dst` pointing at the content of `src`.
#[instrument]
pub async fn hard_link(
    src: impl AsRef<Path> + StdDebug,
    dst: impl AsRef<Path> + StdDebug,
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    tokio::fs::hard_link(src, dst)
        .await
        .with_context(|| format!("hard link {src:?} to {dst:?}"))
}

/// Copy `src` to `dst`, returning the number of bytes copied.
#[instrument]
pub async fn copy(
    src: impl AsRef<Path> + StdDebug,
    dst: impl AsRef<Path> + StdDebug,
) -> Result<u64> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("copy {src:?} to {dst:?}"))
}

/// Rename `src` to `dst`.
#[instrument]
pub async fn rename(
    src: impl AsRef<Path> + StdDebug,
    dst: impl AsRef<Path> + StdDebug,
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    tokio::fs::rename(src, dst)
        .await
        .with_context(|| format!("rename {src:?} to {dst:?}"))
}

/// Set or clear the read-only bit on a file.
#[instrument]
pub async fn set_readonly(path: impl AsRef<Path> + StdDebug, readonly: bool) -> Result<()> {
    let path = path.as_ref();
    let mut permissions = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {path:?}"))?
        .permissions();
    permissions.set_readonly(readonly);
    tokio::fs::set_permissions(path, permissions)
        .await
        .with_context(|| format!("set permissions on {path:?}"))
}

/// Hash the contents of the file, returning the hash and the byte length.
#[instrument]
pub async fn hash_file(path: impl AsRef<Path> + StdDebug) -> Result<(ContentHash, u64)> {
    let path = path.as_ref().to_path_buf();
    spawn_blocking(move || -> Result<(ContentHash, u64)> {
        let file =
            std::fs::File::open(&path).with_context(|| format!("open file {path:?}"))?;
        let mut reader = std::io::BufReader::with_capacity(LOCAL_BUFFER_SIZE, file);
        let mut hasher = blake3::Hasher::new();
        let bytes = std::io::copy(&mut reader, &mut hasher)
            .with_context(|| format!("hash file {path:?}"))?;
        Ok((ContentHash::from_blake3(hasher.finalize()), bytes))
    })
    .await
    .context("join task")?
    .tap_ok(|(hash, bytes)| trace!(%hash, bytes, "hashed file"))
}

/// The byte length of the file.
#[instrument]
pub async fn file_len(path: impl AsRef<Path> + StdDebug) -> Result<u64> {
    let path = path.as_ref();
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .with_context(|| format!("stat {path:?}"))
}

/// The number of hard links to the file's inode.
///
/// Does not follow symlinks: a symlink's own link count is reported.
#[cfg(unix)]
#[instrument]
pub async fn hardlink_count(path: impl AsRef<Path> + StdDebug) -> Result<u64> {
    use std::os::unix::fs::MetadataExt;
    let path = path.as_ref();
    tokio::fs::symlink_metadata(path)
        .await
        .map(|m| m.nlink())
        .with_context(|| format!("stat {path:?}"))
}

/// Enumerate the member names of a directory, sorted ascending.
///
/// Returns `(name, is_dir)` pairs. Sorting is what makes directory-membership
/// fingerprints stable across platforms and readdir orderings.
#[instrument]
pub async fn enumerate_sorted(path: impl AsRef<Path> + StdDebug) -> Result<Vec<(String, bool)>> {
    let path = path.as_ref();
    let mut reader = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("enumerate directory {path:?}"))?;

    let mut members = Vec::new();
    while let Some(entry) = reader.next_entry().await.context("read directory entry")? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        members.push((name, is_dir));
    }
    members.sort();
    Ok(members)
}

/// Set the file's modification time.
#[instrument]
pub async fn set_mtime(path: impl AsRef<Path> + StdDebug, mtime: FileTime) -> Result<()> {
    let path = path.as_ref().to_path_buf();
    spawn_blocking(move || {
        filetime::set_file_mtime(&path, mtime).with_context(|| format!("set mtime on {path:?}"))
    })
    .await
    .context("join task")?
}

/// Set the file's modification time without following symlinks: a symlink's
/// own timestamp changes, not its target's.
#[instrument]
pub async fn set_symlink_mtime(path: impl AsRef<Path> + StdDebug, mtime: FileTime) -> Result<()> {
    let path = path.as_ref().to_path_buf();
    spawn_blocking(move || {
        let atime = FileTime::from_last_access_time(
            &std::fs::symlink_metadata(&path).with_context(|| format!("stat {path:?}"))?,
        );
        filetime::set_symlink_file_times(&path, atime, mtime)
            .with_context(|| format!("set symlink mtime on {path:?}"))
    })
    .await
    .context("join task")?
}

/// Read the file's modification time without following symlinks.
#[instrument]
pub async fn symlink_mtime(path: impl AsRef<Path> + StdDebug) -> Result<FileTime> {
    let path = path.as_ref();
    tokio::fs::symlink_metadata(path)
        .await
        .map(|m| FileTime::from_last_modification_time(&m))
        .with_context(|| format!("stat {path:?}"))
}

/// Set an extended attribute on the file.
///
/// `follow_symlinks` selects between `setxattr` and `lsetxattr`; shared
/// opaque marking needs both behaviors depending on the host policy.
#[cfg(target_os = "linux")]
#[instrument(skip(value))]
pub async fn set_xattr(
    path: impl AsRef<Path> + StdDebug,
    name: &'static str,
    value: impl AsRef<[u8]>,
    follow_symlinks: bool,
) -> Result<()> {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    let path = path.as_ref().to_path_buf();
    let value = value.as_ref().to_vec();
    spawn_blocking(move || {
        let c_path = CString::new(path.as_os_str().as_bytes()).context("path contains NUL")?;
        let c_name = CString::new(name).context("attribute name contains NUL")?;

        // SAFETY: both strings are valid NUL-terminated C strings and the
        // value buffer outlives the call.
        let rc = unsafe {
            if follow_symlinks {
                libc::setxattr(
                    c_path.as_ptr(),
                    c_name.as_ptr(),
                    value.as_ptr().cast(),
                    value.len(),
                    0,
                )
            } else {
                libc::lsetxattr(
                    c_path.as_ptr(),
                    c_name.as_ptr(),
                    value.as_ptr().cast(),
                    value.len(),
                    0,
                )
            }
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            bail!("set xattr {name:?} on {path:?}: {err}");
        }
        Ok(())
    })
    .await
    .context("join task")?
}

/// Read an extended attribute from the file, or `None` if it is not set.
#[cfg(target_os = "linux")]
#[instrument]
pub async fn get_xattr(
    path: impl AsRef<Path> + StdDebug,
    name: &'static str,
    follow_symlinks: bool,
) -> Result<Option<Vec<u8>>> {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    let path = path.as_ref().to_path_buf();
    spawn_blocking(move || {
        let c_path = CString::new(path.as_os_str().as_bytes()).context("path contains NUL")?;
        let c_name = CString::new(name).context("attribute name contains NUL")?;

        let mut buffer = vec![0u8; 256];
        // SAFETY: the strings are valid C strings and the buffer length is
        // passed alongside its pointer.
        let rc = unsafe {
            if follow_symlinks {
                libc::getxattr(
                    c_path.as_ptr(),
                    c_name.as_ptr(),
                    buffer.as_mut_ptr().cast(),
                    buffer.len(),
                )
            } else {
                libc::lgetxattr(
                    c_path.as_ptr(),
                    c_name.as_ptr(),
                    buffer.as_mut_ptr().cast(),
                    buffer.len(),
                )
            }
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENODATA) | Some(libc::ENOENT) => Ok(None),
                _ => bail!("get xattr {name:?} on {path:?}: {err}"),
            };
        }
        buffer.truncate(rc as usize);
        Ok(Some(buffer))
    })
    .await
    .context("join task")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[tokio::test]
    async fn atomic_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.txt");

        write_atomic(&path, b"payload").await.unwrap();
        let read = must_read_buffered(&path).await.unwrap();
        pretty_assert_eq!(read, b"payload");
    }

    #[tokio::test]
    async fn read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let read = read_buffered(dir.path().join("missing")).await.unwrap();
        pretty_assert_eq!(read, None);
    }

    #[tokio::test]
    async fn hash_file_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        write(&path, b"content under test").await.unwrap();

        let (hash, len) = hash_file(&path).await.unwrap();
        pretty_assert_eq!(hash, ContentHash::from_buffer(b"content under test"));
        pretty_assert_eq!(len, 18);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hardlink_count_observes_links() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write(&a, b"x").await.unwrap();

        pretty_assert_eq!(hardlink_count(&a).await.unwrap(), 1);
        hard_link(&a, &b).await.unwrap();
        pretty_assert_eq!(hardlink_count(&a).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn store_lock_is_reacquirable_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = StoreLock::at(dir.path().join("locks").join("scrub.lock"));

        let guard = lock.hold().await.unwrap();
        drop(guard);
        let _guard = lock.hold().await.unwrap();
    }

    #[tokio::test]
    async fn enumerate_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path().join("b.txt"), b"").await.unwrap();
        write(dir.path().join("a.txt"), b"").await.unwrap();
        create_dir_all(dir.path().join("c")).await.unwrap();

        let members = enumerate_sorted(dir.path()).await.unwrap();
        pretty_assert_eq!(
            members,
            vec![
                ("a.txt".to_string(), false),
                ("b.txt".to_string(), false),
                ("c".to_string(), true),
            ]
        );
    }
}
