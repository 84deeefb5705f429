//! Interned canonical paths.
//!
//! Every path the engine carries is an absolute path interned into a
//! [`PathTable`]; the rest of the engine passes the dense [`PathId`] around
//! and compares by id. The table is append-only: ids are never reused or
//! remapped within a build, which is what makes concurrent readers safe
//! against a single appender.
//!
//! ## Normalization
//!
//! The table does NOT normalize paths. `some/path` and `some/path/` are
//! different entries, as are `a/../b` and `b`. Callers are expected to hand
//! the table canonical absolute paths; the [`crate::translate`] module is
//! the one place where prefixes are rewritten, and it runs before interning.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use color_eyre::{Result, eyre::bail};
use dashmap::DashMap;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// A dense identifier for an interned path. Equality by id is equality of
/// the underlying canonical path.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("path{_0}")]
pub struct PathId(pub u32);

/// Append-only interning table for canonical absolute paths.
#[derive(Debug, Default)]
pub struct PathTable {
    ids: DashMap<PathBuf, PathId>,
    entries: RwLock<Vec<Arc<PathBuf>>>,
    append: Mutex<()>,
}

impl PathTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an absolute path, returning its id. Re-interning an existing
    /// path returns the same id.
    pub fn intern(&self, path: impl AsRef<Path>) -> Result<PathId> {
        let path = path.as_ref();
        if !path.is_absolute() {
            bail!("path is not absolute: {path:?}");
        }

        if let Some(existing) = self.ids.get(path) {
            return Ok(*existing);
        }

        // Appends serialize on this lock; readers never block on it.
        let _guard = self.append.lock().expect("path table append lock");
        if let Some(existing) = self.ids.get(path) {
            return Ok(*existing);
        }

        let mut entries = self.entries.write().expect("path table entries lock");
        let id = PathId(entries.len() as u32);
        entries.push(Arc::new(path.to_path_buf()));
        drop(entries);

        self.ids.insert(path.to_path_buf(), id);
        Ok(id)
    }

    /// Resolve an id back to its path.
    ///
    /// Panics if the id was not produced by this table; ids are not
    /// transferable between tables.
    pub fn resolve(&self, id: PathId) -> Arc<PathBuf> {
        let entries = self.entries.read().expect("path table entries lock");
        entries[id.0 as usize].clone()
    }

    /// Resolve an id to a lossily-converted string.
    pub fn resolve_lossy(&self, id: PathId) -> String {
        self.resolve(id).to_string_lossy().into_owned()
    }

    /// Look up the id of a previously-interned path without interning.
    pub fn lookup(&self, path: impl AsRef<Path>) -> Option<PathId> {
        self.ids.get(path.as_ref()).map(|id| *id)
    }

    /// The number of interned paths.
    pub fn len(&self) -> usize {
        self.entries.read().expect("path table entries lock").len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn interning_is_stable() {
        let table = PathTable::new();
        let a = table.intern("/src/main.rs").unwrap();
        let b = table.intern("/src/lib.rs").unwrap();
        let a2 = table.intern("/src/main.rs").unwrap();

        pretty_assert_eq!(a, a2);
        assert_ne!(a, b);
        pretty_assert_eq!(table.resolve(a).as_path(), Path::new("/src/main.rs"));
    }

    #[test]
    fn rejects_relative_paths() {
        let table = PathTable::new();
        assert!(table.intern("src/main.rs").is_err());
    }

    #[test]
    fn no_normalization() {
        let table = PathTable::new();
        let a = table.intern("/src/../src/main.rs").unwrap();
        let b = table.intern("/src/main.rs").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn concurrent_interning_converges() {
        let table = Arc::new(PathTable::new());
        let handles = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| table.intern(format!("/file/{i}")).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let results = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();

        for other in &results[1..] {
            pretty_assert_eq!(&results[0], other);
        }
        pretty_assert_eq!(table.len(), 100);
    }
}
