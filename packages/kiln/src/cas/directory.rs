//! The content location directory.
//!
//! A two-level map from content hash to the machines believed to hold that
//! content: a per-machine local view (what this engine has learned and
//! published this build) layered over a global view shared by the cluster.
//! The directory is read-mostly and optimistically updated; a failed verify
//! purges the bad record asynchronously with at-least-once delivery, so a
//! dead record never survives more than one verification cycle.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use color_eyre::Result;
use dashmap::DashMap;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};
use wire::{ContentHash, dist::v1::MachineLocation};

use crate::error::retry_transient;

/// One claim that a machine holds a piece of content.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct LocationRecord {
    pub location: MachineLocation,
    /// When the claim was last confirmed by actually talking to the
    /// machine; `None` means never.
    pub verified_at: Option<Timestamp>,
}

impl LocationRecord {
    /// Whether the record counts as verified within `window`.
    pub fn is_verified_within(&self, window: Duration, now: Timestamp) -> bool {
        self.verified_at.is_some_and(|at| {
            let age_millis = now.as_millisecond() - at.as_millisecond();
            age_millis >= 0 && age_millis as u128 <= window.as_millis()
        })
    }
}

/// The shared, cluster-wide level of the directory.
///
/// The concrete backing table (a service, a database) lives with the host;
/// the engine consumes this trait. [`InMemoryGlobalDirectory`] is the
/// in-process implementation used by single-cluster deployments and tests.
pub trait GlobalDirectory: Clone + Send + Sync + 'static {
    fn fetch(
        &self,
        hash: &ContentHash,
    ) -> impl Future<Output = Result<Vec<LocationRecord>>> + Send;

    fn publish(
        &self,
        hash: &ContentHash,
        record: LocationRecord,
    ) -> impl Future<Output = Result<()>> + Send;

    fn purge(
        &self,
        hash: &ContentHash,
        location: &MachineLocation,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// A process-local global directory: an entity table keyed by content hash
/// with a secondary map by machine location. Shared by `Arc`, so several
/// stores in one process (or one test) see the same cluster state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryGlobalDirectory {
    entries: Arc<DashMap<ContentHash, BTreeMap<String, LocationRecord>>>,
}

impl InMemoryGlobalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of locations currently recorded for a hash.
    pub fn location_count(&self, hash: &ContentHash) -> usize {
        self.entries.get(hash).map(|m| m.len()).unwrap_or(0)
    }
}

impl GlobalDirectory for InMemoryGlobalDirectory {
    async fn fetch(&self, hash: &ContentHash) -> Result<Vec<LocationRecord>> {
        Ok(self
            .entries
            .get(hash)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, hash: &ContentHash, record: LocationRecord) -> Result<()> {
        self.entries
            .entry(*hash)
            .or_default()
            .insert(record.location.as_str().to_string(), record);
        Ok(())
    }

    async fn purge(&self, hash: &ContentHash, location: &MachineLocation) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(hash) {
            entry.remove(location.as_str());
        }
        Ok(())
    }
}

/// The layered directory one store works against.
#[derive(Clone, Debug)]
pub struct LocationDirectory<G> {
    this_machine: MachineLocation,
    local: Arc<DashMap<ContentHash, BTreeMap<String, LocationRecord>>>,
    global: G,
}

impl<G: GlobalDirectory> LocationDirectory<G> {
    pub fn new(this_machine: MachineLocation, global: G) -> Self {
        Self {
            this_machine,
            local: Arc::new(DashMap::new()),
            global,
        }
    }

    pub fn this_machine(&self) -> &MachineLocation {
        &self.this_machine
    }

    /// Record that this machine now holds the content, locally and in the
    /// global view.
    #[instrument(skip(self))]
    pub async fn publish_self(&self, hash: &ContentHash) -> Result<()> {
        let record = LocationRecord {
            location: self.this_machine.clone(),
            verified_at: Some(Timestamp::now()),
        };
        self.record_local(hash, record.clone());
        self.global.publish(hash, record).await
    }

    /// Record a claim learned out-of-band (e.g. a peer answered a copy).
    pub fn record_local(&self, hash: &ContentHash, record: LocationRecord) {
        self.local
            .entry(*hash)
            .or_default()
            .insert(record.location.as_str().to_string(), record);
    }

    /// Fetch the known locations for a hash: local index first, then the
    /// global view, with this machine's own record subtracted (local
    /// presence is checked separately, before the directory is consulted).
    #[instrument(skip(self))]
    pub async fn fetch_remote_records(&self, hash: &ContentHash) -> Result<Vec<LocationRecord>> {
        let mut merged: BTreeMap<String, LocationRecord> = BTreeMap::new();

        for record in self.global.fetch(hash).await? {
            merged.insert(record.location.as_str().to_string(), record);
        }
        // The local view is fresher: learned this build, never older than
        // the global table. It wins on conflict.
        if let Some(local) = self.local.get(hash) {
            for (key, record) in local.iter() {
                merged.insert(key.clone(), record.clone());
            }
        }
        merged.remove(self.this_machine.as_str());

        let records = merged
            .into_values()
            .filter(|r| !r.location.is_invalid())
            .collect::<Vec<_>>();
        trace!(%hash, records = records.len(), "fetched location records");
        Ok(records)
    }

    /// Mark a record verified now.
    pub async fn mark_verified(&self, hash: &ContentHash, location: &MachineLocation) -> Result<()> {
        let record = LocationRecord {
            location: location.clone(),
            verified_at: Some(Timestamp::now()),
        };
        self.record_local(hash, record.clone());
        self.global.publish(hash, record).await
    }

    /// Remove a bad record asynchronously with at-least-once delivery.
    ///
    /// Verification failures call this and move on; the purge retries in
    /// the background until the global view drops the record.
    #[instrument(skip(self))]
    pub fn purge_async(&self, hash: ContentHash, location: MachineLocation) {
        if let Some(mut entry) = self.local.get_mut(&hash) {
            entry.remove(location.as_str());
        }

        let global = self.global.clone();
        tokio::spawn(async move {
            let outcome = retry_transient(
                5,
                Duration::from_millis(50),
                |_| true,
                || global.purge(&hash, &location),
            )
            .await;
            match outcome {
                Ok(()) => debug!(%hash, %location, "purged stale location record"),
                Err(err) => warn!(%hash, %location, ?err, "failed to purge location record"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn machine(name: &str) -> MachineLocation {
        MachineLocation::new(format!("cas://{name}"))
    }

    #[tokio::test]
    async fn fetch_merges_levels_and_subtracts_self() {
        let global = InMemoryGlobalDirectory::new();
        let directory = LocationDirectory::new(machine("self"), global.clone());
        let hash = ContentHash::from_buffer(b"blob");

        global
            .publish(
                &hash,
                LocationRecord {
                    location: machine("peer-a"),
                    verified_at: None,
                },
            )
            .await
            .unwrap();
        directory.publish_self(&hash).await.unwrap();
        directory.record_local(
            &hash,
            LocationRecord {
                location: machine("peer-b"),
                verified_at: Some(Timestamp::now()),
            },
        );

        let records = directory.fetch_remote_records(&hash).await.unwrap();
        let mut locations = records
            .iter()
            .map(|r| r.location.as_str().to_string())
            .collect::<Vec<_>>();
        locations.sort();
        pretty_assert_eq!(locations, vec!["cas://peer-a", "cas://peer-b"]);
    }

    #[tokio::test]
    async fn invalid_locations_are_filtered() {
        let global = InMemoryGlobalDirectory::new();
        let directory = LocationDirectory::new(machine("self"), global.clone());
        let hash = ContentHash::from_buffer(b"blob");

        global
            .publish(
                &hash,
                LocationRecord {
                    location: MachineLocation::invalid(),
                    verified_at: None,
                },
            )
            .await
            .unwrap();

        let records = directory.fetch_remote_records(&hash).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn purge_eventually_removes_global_records() {
        let global = InMemoryGlobalDirectory::new();
        let directory = LocationDirectory::new(machine("self"), global.clone());
        let hash = ContentHash::from_buffer(b"blob");

        let stale = machine("gone");
        global
            .publish(
                &hash,
                LocationRecord {
                    location: stale.clone(),
                    verified_at: None,
                },
            )
            .await
            .unwrap();
        pretty_assert_eq!(global.location_count(&hash), 1);

        directory.purge_async(hash, stale);
        // The purge task runs on the same runtime; give it a moment.
        for _ in 0..50 {
            if global.location_count(&hash) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pretty_assert_eq!(global.location_count(&hash), 0);
    }

    #[test]
    fn verification_window() {
        let record = LocationRecord {
            location: machine("a"),
            verified_at: Some(Timestamp::now()),
        };
        assert!(record.is_verified_within(Duration::from_secs(60), Timestamp::now()));

        let stale = LocationRecord {
            location: machine("b"),
            verified_at: Some(Timestamp::now() - jiff::Span::new().hours(2)),
        };
        assert!(!stale.is_verified_within(Duration::from_secs(60), Timestamp::now()));
    }
}
