//! SQLite-backed fingerprint metadata storage.
//!
//! Two tables: `path_sets` holds the canonical path-set blobs observed for
//! each weak fingerprint (ordered by use for lookup), and `descriptors`
//! holds the encoded cache descriptor for each (weak, strong) pair.

use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use color_eyre::{Result, eyre::Context};
use derive_more::Debug;
use rusqlite::{Connection, OptionalExtension, params};
use strum::Display as StrumDisplay;
use tracing::{debug, instrument, warn};

use crate::fingerprint::{PathSet, StrongFingerprint, WeakFingerprint};

use super::descriptor::{CacheDescriptor, decode, encode};

/// What `publish` does when a descriptor already exists for the key.
///
/// There is no default on purpose: every publish site decides explicitly.
#[derive(Copy, Clone, Eq, PartialEq, Debug, StrumDisplay)]
pub enum ReplacementBehavior {
    /// Replace unconditionally.
    AlwaysOverwrite,
    /// Keep the stored descriptor when it is byte-equal; replace (and count
    /// a divergence) when it differs.
    ElideIfEquivalent,
    /// Compare output content lists before replacing: identical outputs
    /// elide even when metadata differs.
    CheckContentsFirst,
}

/// What a publish did.
#[derive(Copy, Clone, Eq, PartialEq, Debug, StrumDisplay)]
pub enum PublishOutcome {
    /// Newly stored.
    Stored,
    /// An equivalent descriptor was already present.
    Elided,
    /// A different descriptor was present; the new one won and a divergence
    /// was counted.
    Diverged,
}

/// The fingerprint metadata store.
#[derive(Debug)]
pub struct MetadataStore {
    #[debug("<connection>")]
    conn: Mutex<Connection>,
    /// Window within which descriptors are young enough to skip output
    /// pinning.
    pin_elision_window: Duration,
    divergences: AtomicU64,
}

impl MetadataStore {
    /// Open or create a metadata database at the given path.
    #[instrument(name = "MetadataStore::open", skip(path))]
    pub fn open(path: impl AsRef<Path>, pin_elision_window: Duration) -> Result<Arc<Self>> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            // Synchronous startup work; the async fs module is not up yet.
            #[allow(clippy::disallowed_methods)]
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create metadata directory {parent:?}"))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("open metadata database at {path:?}"))?;
        let store = Self {
            conn: Mutex::new(conn),
            pin_elision_window,
            divergences: AtomicU64::new(0),
        };
        store.init_schema()?;
        Ok(Arc::new(store))
    }

    /// Create an in-memory store.
    pub fn in_memory(pin_elision_window: Duration) -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
            pin_elision_window,
            divergences: AtomicU64::new(0),
        };
        store.init_schema()?;
        Ok(Arc::new(store))
    }

    fn init_schema(&self) -> Result<()> {
        self.lock_conn()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS path_sets (
                    weak_fp TEXT NOT NULL,
                    ps_id TEXT NOT NULL,
                    ps_blob BLOB NOT NULL,
                    use_count INTEGER NOT NULL DEFAULT 0,
                    last_used INTEGER NOT NULL,
                    PRIMARY KEY (weak_fp, ps_id)
                );

                CREATE INDEX IF NOT EXISTS idx_path_sets_usage
                ON path_sets(weak_fp, use_count DESC, last_used DESC);

                CREATE TABLE IF NOT EXISTS descriptors (
                    weak_fp TEXT NOT NULL,
                    strong_fp TEXT NOT NULL,
                    blob BLOB NOT NULL,
                    published_at INTEGER NOT NULL,
                    PRIMARY KEY (weak_fp, strong_fp)
                );

                CREATE TABLE IF NOT EXISTS pip_history (
                    semi_stable INTEGER PRIMARY KEY,
                    weak_fp TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )
            .context("initialize metadata schema")
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("metadata connection lock")
    }

    fn now_millis() -> i64 {
        jiff::Timestamp::now().as_millisecond()
    }

    /// The path sets previously observed for this weak fingerprint, most
    /// used (then most recently used) first.
    #[instrument(name = "MetadataStore::get_path_sets", skip(self))]
    pub fn get_path_sets(&self, weak: &WeakFingerprint) -> Result<Vec<PathSet>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT ps_blob FROM path_sets WHERE weak_fp = ?1
                 ORDER BY use_count DESC, last_used DESC",
            )
            .context("prepare path-set query")?;

        let blobs = stmt
            .query_map(params![weak.to_string()], |row| row.get::<_, Vec<u8>>(0))
            .context("execute path-set query")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("read path-set rows")?;
        drop(stmt);
        drop(conn);

        let mut path_sets = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match PathSet::from_canonical_bytes(&blob) {
                Ok(path_set) => path_sets.push(path_set),
                // A corrupt path set is skipped, not fatal: its descriptor
                // simply becomes unreachable.
                Err(err) => warn!(?err, "skipping corrupt stored path set"),
            }
        }
        Ok(path_sets)
    }

    /// Bump usage counters for a path set that produced a hit.
    #[instrument(name = "MetadataStore::note_path_set_used", skip(self, path_set))]
    pub fn note_path_set_used(&self, weak: &WeakFingerprint, path_set: &PathSet) -> Result<()> {
        self.lock_conn()
            .execute(
                "UPDATE path_sets SET use_count = use_count + 1, last_used = ?3
                 WHERE weak_fp = ?1 AND ps_id = ?2",
                params![
                    weak.to_string(),
                    path_set.id().to_string(),
                    Self::now_millis()
                ],
            )
            .context("bump path-set usage")?;
        Ok(())
    }

    /// The descriptor stored for this fingerprint pair, if any. Corrupt
    /// descriptors read as `None`.
    #[instrument(name = "MetadataStore::get_descriptor", skip(self))]
    pub fn get_descriptor(
        &self,
        weak: &WeakFingerprint,
        strong: &StrongFingerprint,
    ) -> Result<Option<CacheDescriptor>> {
        let blob = self
            .lock_conn()
            .query_row(
                "SELECT blob FROM descriptors WHERE weak_fp = ?1 AND strong_fp = ?2",
                params![weak.to_string(), strong.to_string()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .context("query descriptor")?;

        Ok(blob.as_deref().and_then(decode))
    }

    /// Publish a descriptor under `(weak, path set, strong)`.
    ///
    /// Idempotent under equal keys and equal descriptors. When the stored
    /// descriptor differs, the most recent publish wins and a divergence is
    /// counted; `behavior` controls how equivalence is judged.
    #[instrument(name = "MetadataStore::publish", skip(self, path_set, descriptor))]
    pub fn publish(
        &self,
        weak: &WeakFingerprint,
        path_set: &PathSet,
        strong: &StrongFingerprint,
        descriptor: &CacheDescriptor,
        behavior: ReplacementBehavior,
    ) -> Result<PublishOutcome> {
        let now = Self::now_millis();
        let encoded = encode(descriptor)?;

        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO path_sets (weak_fp, ps_id, ps_blob, use_count, last_used)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT (weak_fp, ps_id)
             DO UPDATE SET use_count = use_count + 1, last_used = ?4",
            params![
                weak.to_string(),
                path_set.id().to_string(),
                path_set.canonical_bytes(),
                now
            ],
        )
        .context("upsert path set")?;

        let existing = conn
            .query_row(
                "SELECT blob FROM descriptors WHERE weak_fp = ?1 AND strong_fp = ?2",
                params![weak.to_string(), strong.to_string()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .context("query existing descriptor")?;

        let outcome = match existing.as_deref().and_then(decode) {
            None => PublishOutcome::Stored,
            Some(stored) if behavior == ReplacementBehavior::AlwaysOverwrite => {
                if stored == *descriptor {
                    PublishOutcome::Stored
                } else {
                    PublishOutcome::Diverged
                }
            }
            Some(stored) => {
                let equivalent = match behavior {
                    ReplacementBehavior::ElideIfEquivalent => stored == *descriptor,
                    ReplacementBehavior::CheckContentsFirst => {
                        stored.outputs == descriptor.outputs
                    }
                    ReplacementBehavior::AlwaysOverwrite => unreachable!(),
                };
                if equivalent {
                    PublishOutcome::Elided
                } else {
                    PublishOutcome::Diverged
                }
            }
        };

        match outcome {
            PublishOutcome::Elided => {}
            PublishOutcome::Stored | PublishOutcome::Diverged => {
                conn.execute(
                    "INSERT INTO descriptors (weak_fp, strong_fp, blob, published_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (weak_fp, strong_fp)
                     DO UPDATE SET blob = ?3, published_at = ?4",
                    params![weak.to_string(), strong.to_string(), encoded, now],
                )
                .context("upsert descriptor")?;
            }
        }
        drop(conn);

        if outcome == PublishOutcome::Diverged {
            self.divergences.fetch_add(1, Ordering::Relaxed);
            warn!(%weak, %strong, "descriptor divergence: most recent publish wins");
        }
        debug!(%weak, %strong, %outcome, "published descriptor");
        Ok(outcome)
    }

    /// If the descriptor for `strong` is younger than the elision window,
    /// the remaining window: consumers may skip pinning its outputs for
    /// that long.
    #[instrument(name = "MetadataStore::pin_elision_hint", skip(self))]
    pub fn pin_elision_hint(&self, strong: &StrongFingerprint) -> Result<Option<Duration>> {
        let published_at = self
            .lock_conn()
            .query_row(
                "SELECT published_at FROM descriptors WHERE strong_fp = ?1
                 ORDER BY published_at DESC LIMIT 1",
                params![strong.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("query descriptor age")?;

        let Some(published_at) = published_at else {
            return Ok(None);
        };
        let age_millis = (Self::now_millis() - published_at).max(0) as u64;
        let age = Duration::from_millis(age_millis);
        Ok(self.pin_elision_window.checked_sub(age))
    }

    /// How many conflicting publishes this store has seen.
    pub fn divergence_count(&self) -> u64 {
        self.divergences.load(Ordering::Relaxed)
    }

    /// Record the weak fingerprint a pip ran under, keyed by its
    /// semi-stable hash. Used to tell "this pip changed" apart from "this
    /// pip was never seen".
    #[instrument(name = "MetadataStore::note_pip_weak", skip(self))]
    pub fn note_pip_weak(&self, semi_stable: u64, weak: &WeakFingerprint) -> Result<()> {
        self.lock_conn()
            .execute(
                "INSERT INTO pip_history (semi_stable, weak_fp, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (semi_stable) DO UPDATE SET weak_fp = ?2, updated_at = ?3",
                params![semi_stable as i64, weak.to_string(), Self::now_millis()],
            )
            .context("record pip history")?;
        Ok(())
    }

    /// The weak fingerprint this pip last ran under, if recorded.
    #[instrument(name = "MetadataStore::last_pip_weak", skip(self))]
    pub fn last_pip_weak(&self, semi_stable: u64) -> Result<Option<WeakFingerprint>> {
        let rendered = self
            .lock_conn()
            .query_row(
                "SELECT weak_fp FROM pip_history WHERE semi_stable = ?1",
                params![semi_stable as i64],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("query pip history")?;

        match rendered {
            None => Ok(None),
            Some(rendered) => {
                let hash = wire::ContentHash::parse(
                    rendered.trim_start_matches("wf:"),
                )
                .context("parse recorded weak fingerprint")?;
                Ok(Some(WeakFingerprint(hash)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fingerprint::{ObservationKind, canonicalize_path_set},
        translate::DirectoryTranslator,
    };
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use std::path::PathBuf;
    use uuid::Uuid;
    use wire::ContentHash;

    fn store() -> Arc<MetadataStore> {
        MetadataStore::in_memory(Duration::from_secs(600)).unwrap()
    }

    fn weak(tag: &str) -> WeakFingerprint {
        WeakFingerprint(ContentHash::from_buffer(tag))
    }

    fn strong(tag: &str) -> StrongFingerprint {
        StrongFingerprint(ContentHash::from_buffer(tag))
    }

    fn path_set(paths: &[&str]) -> PathSet {
        canonicalize_path_set(
            paths
                .iter()
                .map(|p| (PathBuf::from(p), ObservationKind::FileContent)),
            &DirectoryTranslator::empty(),
            &Default::default(),
        )
    }

    fn descriptor(weak: WeakFingerprint, strong: StrongFingerprint, out: &str) -> CacheDescriptor {
        CacheDescriptor {
            weak,
            strong,
            outputs: vec![super::super::DescriptorOutput {
                path: "/out/a".into(),
                hash: ContentHash::from_buffer(out.as_bytes()),
                rewrite_count: 1,
            }],
            observed_inputs: vec![],
            trace_info: String::new(),
            session_id: Uuid::nil(),
            stored_at: jiff::Timestamp::UNIX_EPOCH,
        }
    }

    #[test]
    fn publish_then_get_round_trips() {
        let store = store();
        let (wf, sf) = (weak("w"), strong("s"));
        let ps = path_set(&["/src/a"]);
        let desc = descriptor(wf, sf, "A");

        let outcome = store
            .publish(&wf, &ps, &sf, &desc, ReplacementBehavior::ElideIfEquivalent)
            .unwrap();
        pretty_assert_eq!(outcome, PublishOutcome::Stored);
        pretty_assert_eq!(store.get_descriptor(&wf, &sf).unwrap(), Some(desc));
    }

    #[test]
    fn publish_is_idempotent() {
        let store = store();
        let (wf, sf) = (weak("w"), strong("s"));
        let ps = path_set(&["/src/a"]);
        let desc = descriptor(wf, sf, "A");

        store
            .publish(&wf, &ps, &sf, &desc, ReplacementBehavior::ElideIfEquivalent)
            .unwrap();
        let outcome = store
            .publish(&wf, &ps, &sf, &desc, ReplacementBehavior::ElideIfEquivalent)
            .unwrap();
        pretty_assert_eq!(outcome, PublishOutcome::Elided);
        pretty_assert_eq!(store.divergence_count(), 0);
        pretty_assert_eq!(store.get_descriptor(&wf, &sf).unwrap(), Some(desc));
    }

    #[test]
    fn divergence_is_counted_and_recent_wins() {
        let store = store();
        let (wf, sf) = (weak("w"), strong("s"));
        let ps = path_set(&["/src/a"]);
        let first = descriptor(wf, sf, "A");
        let second = descriptor(wf, sf, "B");

        store
            .publish(&wf, &ps, &sf, &first, ReplacementBehavior::ElideIfEquivalent)
            .unwrap();
        let outcome = store
            .publish(&wf, &ps, &sf, &second, ReplacementBehavior::ElideIfEquivalent)
            .unwrap();
        pretty_assert_eq!(outcome, PublishOutcome::Diverged);
        pretty_assert_eq!(store.divergence_count(), 1);
        pretty_assert_eq!(store.get_descriptor(&wf, &sf).unwrap(), Some(second));
    }

    #[test]
    fn check_contents_first_elides_on_equal_outputs() {
        let store = store();
        let (wf, sf) = (weak("w"), strong("s"));
        let ps = path_set(&["/src/a"]);

        let first = descriptor(wf, sf, "A");
        let mut second = descriptor(wf, sf, "A");
        second.trace_info = "different machine".into();

        store
            .publish(&wf, &ps, &sf, &first, ReplacementBehavior::CheckContentsFirst)
            .unwrap();
        let outcome = store
            .publish(&wf, &ps, &sf, &second, ReplacementBehavior::CheckContentsFirst)
            .unwrap();
        pretty_assert_eq!(outcome, PublishOutcome::Elided);
        pretty_assert_eq!(store.divergence_count(), 0);
    }

    #[test]
    fn path_sets_order_by_usage() {
        let store = store();
        let wf = weak("w");
        let cold = path_set(&["/src/cold"]);
        let hot = path_set(&["/src/hot"]);

        store
            .publish(&wf, &cold, &strong("s1"), &descriptor(wf, strong("s1"), "A"),
                ReplacementBehavior::ElideIfEquivalent)
            .unwrap();
        store
            .publish(&wf, &hot, &strong("s2"), &descriptor(wf, strong("s2"), "B"),
                ReplacementBehavior::ElideIfEquivalent)
            .unwrap();
        for _ in 0..3 {
            store.note_path_set_used(&wf, &hot).unwrap();
        }

        let sets = store.get_path_sets(&wf).unwrap();
        pretty_assert_eq!(sets.len(), 2);
        pretty_assert_eq!(sets[0], hot);
        pretty_assert_eq!(sets[1], cold);
    }

    #[test]
    fn unknown_weak_fingerprint_has_no_path_sets() {
        let store = store();
        assert!(store.get_path_sets(&weak("unseen")).unwrap().is_empty());
        assert!(
            store
                .get_descriptor(&weak("unseen"), &strong("s"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn pip_history_round_trips() {
        let store = store();
        assert!(store.last_pip_weak(42).unwrap().is_none());

        store.note_pip_weak(42, &weak("first")).unwrap();
        pretty_assert_eq!(store.last_pip_weak(42).unwrap(), Some(weak("first")));

        store.note_pip_weak(42, &weak("second")).unwrap();
        pretty_assert_eq!(store.last_pip_weak(42).unwrap(), Some(weak("second")));
    }

    #[test]
    fn pin_elision_hint_reflects_age() {
        let store = store();
        let (wf, sf) = (weak("w"), strong("s"));
        let ps = path_set(&["/src/a"]);

        assert!(store.pin_elision_hint(&sf).unwrap().is_none());

        store
            .publish(&wf, &ps, &sf, &descriptor(wf, sf, "A"),
                ReplacementBehavior::ElideIfEquivalent)
            .unwrap();
        let hint = store.pin_elision_hint(&sf).unwrap();
        assert!(hint.is_some_and(|h| h > Duration::from_secs(590)));
    }
}
