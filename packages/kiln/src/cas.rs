//! The content store.
//!
//! Keyed-by-hash blob storage with a local mirror, a multi-level location
//! directory, and remote replicas. The intention is that the store should
//! be as "stupid" as possible: purely concerned with bytes keyed by their
//! hash, with no knowledge of pips or fingerprints. The interesting policy
//! lives in [`ContentStore::pin`], which decides when enough replicas exist
//! to promise availability without copying bytes around.
//!
//! ## Operations
//!
//! - `put_file` / `put_buffer` / `put_stream`: ingest content, publishing a
//!   location record for this machine.
//! - `open_stream`: local-first read; on miss, copy from the best peer.
//! - `place_file`: pin, then hardlink/copy/move into a destination path.
//! - `pin` / `pin_bulk`: the risk-threshold availability promise.
//! - `verify`: confirm a location record, purging it on failure.
//! - `proactive_copy_if_needed`: push under-replicated content outward.

pub mod directory;
pub mod local;
pub mod pin;
pub mod remote;

use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
    sync::Arc,
};

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures::{StreamExt, stream};
use rand::seq::SliceRandom;
use strum::Display as StrumDisplay;
use tokio::{io::AsyncRead, io::AsyncReadExt, sync::Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use wire::{ContentHash, dist::v1::MachineLocation};

use crate::{config::PinConfig, fs};

use self::{
    directory::{GlobalDirectory, LocationDirectory, LocationRecord},
    local::{IngestMode, LocalCas},
    pin::{PinCache, PinSource, min_unverified_records, min_verified_records, ttl_for_records},
    remote::RemoteStore,
};

/// The store failure taxonomy. Wrapped in `eyre::Report`s so context chains
/// stay intact; classify with [`error_kind`].
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StoreError {}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, StrumDisplay)]
pub enum StoreErrorKind {
    ContentNotFound,
    IoError,
    ChecksumMismatch,
    /// Retriable: the remote may answer on the next attempt.
    RemoteTransient,
    Canceled,
}

/// The store error kind buried in a report, if any.
pub fn error_kind(report: &color_eyre::Report) -> Option<StoreErrorKind> {
    if let Some(error) = report.downcast_ref::<StoreError>() {
        return Some(error.kind);
    }
    report
        .chain()
        .find_map(|cause| cause.downcast_ref::<StoreError>())
        .map(|e| e.kind)
}

/// Whether a failed store operation is worth retrying.
pub fn is_transient(report: &color_eyre::Report) -> bool {
    error_kind(report) == Some(StoreErrorKind::RemoteTransient)
}

/// How content is realized at a destination path.
#[derive(Copy, Clone, Eq, PartialEq, Debug, StrumDisplay)]
pub enum RealizationMode {
    /// Hardlink out of the store. Degrades to a copy when the destination
    /// needs write access or crosses filesystems.
    Hardlink,
    Copy,
    /// Move the blob out, evicting it from the store.
    Move,
}

/// What to do when the destination already exists.
#[derive(Copy, Clone, Eq, PartialEq, Debug, StrumDisplay)]
pub enum ReplacementMode {
    FailIfExists,
    ReplaceExisting,
    SkipIfExists,
}

/// How the placed file will be used.
#[derive(Copy, Clone, Eq, PartialEq, Debug, StrumDisplay)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// The result of a placement.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PlaceOutcome {
    Placed { bytes: u64 },
    /// `SkipIfExists` found an existing destination.
    SkippedExisting,
    ContentNotFound,
}

/// The result of a pin.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PinOutcome {
    Success(PinSource),
    ContentNotFound,
}

impl PinOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PinOutcome::Success(_))
    }
}

/// How urgently a pin is needed.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum PinUrgency {
    #[default]
    Nominal,
    /// Skip the record-count and verification shortcuts; materialize
    /// locally now.
    High,
}

/// Options for [`ContentStore::pin_bulk`].
#[derive(Copy, Clone, Debug, Default)]
pub struct PinBulkOptions {
    /// Answer "exists somewhere" from the directory without promising local
    /// materialization.
    pub return_global_existence_fast: bool,
}

/// The result of a proactive copy attempt.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ProactiveCopyOutcome {
    Copied(MachineLocation),
    CopyNotRequired,
}

/// Chooses destinations for proactive copies.
#[derive(Clone, Default)]
pub struct ProactiveCopyPolicy {
    /// An explicit predictor consulted first.
    pub predictor: Option<Arc<dyn Fn(&ContentHash) -> Option<MachineLocation> + Send + Sync>>,
    /// Designated locations per hash, consulted second.
    pub designated: HashMap<ContentHash, Vec<MachineLocation>>,
    /// Machines in this store's failure ring; random selection avoids them
    /// unless the caller hints it is copying inside the ring on purpose.
    pub local_ring: BTreeSet<String>,
}

impl std::fmt::Debug for ProactiveCopyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProactiveCopyPolicy")
            .field("predictor", &self.predictor.is_some())
            .field("designated", &self.designated.len())
            .field("local_ring", &self.local_ring)
            .finish()
    }
}

/// The content store: local mirror, location directory, remote replicas.
#[derive(Clone)]
pub struct ContentStore<R, G> {
    local: LocalCas,
    directory: LocationDirectory<G>,
    remotes: Vec<R>,
    pins: Arc<PinCache>,
    config: PinConfig,
    copy_policy: Arc<ProactiveCopyPolicy>,
    /// Admission for place/put operations.
    put_place: Arc<Semaphore>,
    /// Capacity for on-the-spot location verification.
    verify_io: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl<R, G: GlobalDirectory> std::fmt::Debug for ContentStore<R, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentStore({})", self.directory.this_machine())
    }
}

impl<R: RemoteStore, G: GlobalDirectory> ContentStore<R, G> {
    pub fn new(
        local: LocalCas,
        this_machine: MachineLocation,
        global: G,
        remotes: Vec<R>,
        config: PinConfig,
        max_put_place_ops: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local,
            directory: LocationDirectory::new(this_machine, global),
            remotes,
            pins: Arc::new(PinCache::new()),
            verify_io: Arc::new(Semaphore::new(config.verify_capacity.max(1))),
            config,
            copy_policy: Arc::new(ProactiveCopyPolicy::default()),
            put_place: Arc::new(Semaphore::new(max_put_place_ops.max(1))),
            cancel,
        }
    }

    /// Replace the proactive copy policy.
    pub fn with_copy_policy(mut self, policy: ProactiveCopyPolicy) -> Self {
        self.copy_policy = Arc::new(policy);
        self
    }

    /// Replace the pin configuration (and the verification capacity derived
    /// from it).
    pub fn with_pin_config(mut self, config: PinConfig) -> Self {
        self.verify_io = Arc::new(Semaphore::new(config.verify_capacity.max(1)));
        self.config = config;
        self
    }

    /// The local blob mirror.
    pub fn local(&self) -> &LocalCas {
        &self.local
    }

    /// The location directory.
    pub fn directory(&self) -> &LocationDirectory<G> {
        &self.directory
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(eyre!(StoreError {
                kind: StoreErrorKind::Canceled,
                message: "content store operation canceled".into(),
            }));
        }
        Ok(())
    }

    /// Ingest a file into the store.
    ///
    /// When a trusted `hash_hint` is supplied (an upstream copy produced the
    /// bytes and already knows their hash), the content is admitted without
    /// re-hashing; otherwise the file is hashed on the way in.
    #[instrument(name = "ContentStore::put_file", skip(self))]
    pub async fn put_file(
        &self,
        path: &Path,
        hash_hint: Option<(ContentHash, u64)>,
        mode: IngestMode,
    ) -> Result<(ContentHash, u64)> {
        self.check_cancel()?;
        let _permit = self.put_place.acquire().await.context("acquire put permit")?;

        let (hash, len) = match hash_hint {
            Some((hash, len)) => {
                self.local.ingest_file_trusted(path, &hash, mode).await?;
                (hash, len)
            }
            None => {
                let (hash, len, _) = self.local.ingest_file(path, mode).await?;
                (hash, len)
            }
        };

        self.directory.publish_self(&hash).await?;
        self.pins.insert(hash, ttl_for_records(&self.config, 1));
        Ok((hash, len))
    }

    /// Ingest a buffer.
    #[instrument(name = "ContentStore::put_buffer", skip_all)]
    pub async fn put_buffer(&self, content: &[u8]) -> Result<ContentHash> {
        self.check_cancel()?;
        let _permit = self.put_place.acquire().await.context("acquire put permit")?;

        let hash = ContentHash::from_buffer(content);
        self.local.write_trusted(&hash, content).await?;
        self.directory.publish_self(&hash).await?;
        self.pins.insert(hash, ttl_for_records(&self.config, 1));
        Ok(hash)
    }

    /// Ingest a stream.
    #[instrument(name = "ContentStore::put_stream", skip_all)]
    pub async fn put_stream(
        &self,
        mut reader: impl AsyncRead + Unpin + Send,
    ) -> Result<(ContentHash, u64)> {
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .await
            .context("read stream")?;
        let len = content.len() as u64;
        let hash = self.put_buffer(&content).await?;
        Ok((hash, len))
    }

    /// Open the content for reading, copying it from a peer on local miss.
    #[instrument(name = "ContentStore::open_stream", skip(self))]
    pub async fn open_stream(
        &self,
        hash: &ContentHash,
    ) -> Result<Option<impl AsyncRead + Unpin + 'static>> {
        self.check_cancel()?;
        if let Some(reader) = self.local.reader(hash).await? {
            return Ok(Some(reader));
        }

        let records = self.directory.fetch_remote_records(hash).await?;
        if self.copy_local(hash, &records).await?.is_none() {
            return Ok(None);
        }
        self.local.reader(hash).await
    }

    /// Pin: promise the content stays available for a bounded window.
    ///
    /// Evaluated strictly in order:
    /// 1. local presence;
    /// 2. a fresh pin-cache entry;
    /// 3. fetch location records;
    /// 4. enough records for the unverified risk threshold;
    /// 5. enough records for the verified threshold, verified on the spot
    ///    when verification capacity is free;
    /// 6. otherwise copy locally from the best candidate set;
    /// 7. otherwise the content is gone.
    #[instrument(name = "ContentStore::pin", skip(self))]
    pub async fn pin(&self, hash: &ContentHash, urgency: PinUrgency) -> Result<PinOutcome> {
        self.check_cancel()?;

        // (1) Local presence answers immediately; touch the tracker so the
        // next pin takes the cache path.
        if self.local.contains(hash).await {
            self.pins.insert(*hash, ttl_for_records(&self.config, 1));
            return Ok(PinOutcome::Success(PinSource::Local));
        }

        // (2)
        if self.pins.is_fresh(hash) {
            return Ok(PinOutcome::Success(PinSource::PinCache));
        }

        // (3)
        let records = self.directory.fetch_remote_records(hash).await?;
        let shortcuts_allowed =
            urgency == PinUrgency::Nominal && !self.config.always_copy_local;

        // (4)
        let needed_unverified = min_unverified_records(&self.config);
        if shortcuts_allowed && records.len() >= needed_unverified {
            self.pins
                .insert(*hash, ttl_for_records(&self.config, records.len()));
            return Ok(PinOutcome::Success(PinSource::RecordCount));
        }

        // (5)
        let needed_verified = min_verified_records(&self.config);
        let mut candidates = records.clone();
        if shortcuts_allowed && records.len() >= needed_verified {
            if let Ok(_permit) = self.verify_io.clone().try_acquire_owned() {
                let (verified, unknown) = self.verify_records(hash, &records).await;
                if verified.len() >= needed_verified {
                    self.pins
                        .insert(*hash, ttl_for_records(&self.config, verified.len()));
                    return Ok(PinOutcome::Success(PinSource::Verified));
                }
                // Fall through to a local copy with what we learned:
                // verified locations first, then the unknowns.
                candidates = verified.into_iter().chain(unknown).collect();
            }
        }

        // (6)
        if self.copy_local(hash, &candidates).await?.is_some() {
            self.pins.insert(*hash, ttl_for_records(&self.config, 2));
            let this = self.clone();
            let hash = *hash;
            // Replication is best-effort and never blocks the pin.
            tokio::spawn(async move {
                if let Err(err) = this
                    .proactive_copy_if_needed(&hash, "post-pin replication", false)
                    .await
                {
                    debug!(%hash, ?err, "proactive copy after pin failed");
                }
            });
            return Ok(PinOutcome::Success(PinSource::LocalCopy));
        }

        // (7)
        Ok(PinOutcome::ContentNotFound)
    }

    /// Pin many hashes.
    #[instrument(name = "ContentStore::pin_bulk", skip(self, hashes))]
    pub async fn pin_bulk(
        &self,
        hashes: impl IntoIterator<Item = ContentHash>,
        options: PinBulkOptions,
    ) -> Vec<(ContentHash, Result<PinOutcome>)> {
        let hashes = hashes.into_iter().collect::<Vec<_>>();
        stream::iter(hashes)
            .map(|hash| async move {
                let outcome = if options.return_global_existence_fast {
                    self.global_existence(&hash).await
                } else {
                    self.pin(&hash, PinUrgency::Nominal).await
                };
                (hash, outcome)
            })
            .buffer_unordered(self.config.verify_capacity.max(1))
            .collect()
            .await
    }

    /// "Exists somewhere": local, pin-cached, or at least one directory
    /// record. Promises nothing about materialization.
    async fn global_existence(&self, hash: &ContentHash) -> Result<PinOutcome> {
        if self.local.contains(hash).await || self.pins.is_fresh(hash) {
            return Ok(PinOutcome::Success(PinSource::GlobalExistence));
        }
        let records = self.directory.fetch_remote_records(hash).await?;
        if records.is_empty() {
            Ok(PinOutcome::ContentNotFound)
        } else {
            Ok(PinOutcome::Success(PinSource::GlobalExistence))
        }
    }

    /// Place content at a destination path.
    #[instrument(name = "ContentStore::place_file", skip(self))]
    pub async fn place_file(
        &self,
        hash: &ContentHash,
        dst: &Path,
        access: AccessMode,
        replacement: ReplacementMode,
        realization: RealizationMode,
    ) -> Result<PlaceOutcome> {
        self.check_cancel()?;
        let _permit = self
            .put_place
            .acquire()
            .await
            .context("acquire place permit")?;

        match self.pin(hash, PinUrgency::Nominal).await? {
            PinOutcome::ContentNotFound => return Ok(PlaceOutcome::ContentNotFound),
            PinOutcome::Success(_) => {}
        }

        // A pin can succeed on records alone; placement needs the bytes
        // here.
        if !self.local.contains(hash).await {
            let records = self.directory.fetch_remote_records(hash).await?;
            if self.copy_local(hash, &records).await?.is_none() {
                return Ok(PlaceOutcome::ContentNotFound);
            }
        }

        if fs::exists(dst).await {
            match replacement {
                ReplacementMode::FailIfExists => {
                    return Err(eyre!(StoreError {
                        kind: StoreErrorKind::IoError,
                        message: format!("destination already exists: {dst:?}"),
                    }));
                }
                ReplacementMode::SkipIfExists => return Ok(PlaceOutcome::SkippedExisting),
                ReplacementMode::ReplaceExisting => {
                    fs::remove_file_if_exists(dst).await?;
                }
            }
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }

        let bytes = fs::file_len(self.local.blob_path(hash)).await?;
        match (realization, access) {
            // A writable destination must never share an inode with the
            // store.
            (RealizationMode::Hardlink, AccessMode::ReadOnly) => {
                if let Err(err) = self.local.link_to(hash, dst).await {
                    trace!(?err, "hardlink placement failed, copying");
                    self.local.copy_to(hash, dst).await?;
                }
            }
            (RealizationMode::Hardlink, AccessMode::ReadWrite)
            | (RealizationMode::Copy, _) => {
                self.local.copy_to(hash, dst).await?;
            }
            (RealizationMode::Move, _) => {
                self.local.move_to(hash, dst).await?;
            }
        }

        if access == AccessMode::ReadOnly {
            fs::set_readonly(dst, true).await?;
        }
        trace!(%hash, ?dst, "placed content");
        Ok(PlaceOutcome::Placed { bytes })
    }

    /// Confirm a location record by talking to the machine. On failure the
    /// record is purged asynchronously.
    #[instrument(name = "ContentStore::verify", skip(self))]
    pub async fn verify(&self, hash: &ContentHash, location: &MachineLocation) -> Result<bool> {
        let Some(remote) = self.remote_for(location) else {
            self.directory.purge_async(*hash, location.clone());
            return Ok(false);
        };
        match remote.exists(hash).await {
            Ok(true) => {
                self.directory.mark_verified(hash, location).await?;
                Ok(true)
            }
            Ok(false) => {
                self.directory.purge_async(*hash, location.clone());
                Ok(false)
            }
            Err(err) => {
                warn!(%hash, %location, ?err, "verification errored");
                Ok(false)
            }
        }
    }

    /// Push the content outward when it is under-replicated.
    ///
    /// Destination selection, in order: the explicit predictor, the
    /// designated-locations set for the hash, a random machine outside this
    /// store's ring (or inside it when `inside_ring_hint` says the caller
    /// is deliberately replicating nearby).
    #[instrument(name = "ContentStore::proactive_copy_if_needed", skip(self))]
    pub async fn proactive_copy_if_needed(
        &self,
        hash: &ContentHash,
        reason: &str,
        inside_ring_hint: bool,
    ) -> Result<ProactiveCopyOutcome> {
        let records = self.directory.fetch_remote_records(hash).await?;
        // This machine holds a replica too when the content is local.
        let replicas = records.len() + usize::from(self.local.contains(hash).await);
        if replicas >= self.config.replica_threshold {
            return Ok(ProactiveCopyOutcome::CopyNotRequired);
        }

        let existing = records
            .iter()
            .map(|r| r.location.as_str().to_string())
            .collect::<BTreeSet<_>>();
        let Some(target) = self.choose_copy_target(hash, &existing, inside_ring_hint) else {
            return Ok(ProactiveCopyOutcome::CopyNotRequired);
        };
        let Some(remote) = self.remote_for(&target) else {
            return Ok(ProactiveCopyOutcome::CopyNotRequired);
        };
        let Some(content) = self.local.read_buffered(hash).await? else {
            return Ok(ProactiveCopyOutcome::CopyNotRequired);
        };

        remote.push(hash, &content).await?;
        self.directory.mark_verified(hash, &target).await?;
        debug!(%hash, %target, reason, "proactively copied content");
        Ok(ProactiveCopyOutcome::Copied(target))
    }

    fn choose_copy_target(
        &self,
        hash: &ContentHash,
        existing: &BTreeSet<String>,
        inside_ring_hint: bool,
    ) -> Option<MachineLocation> {
        let eligible = |location: &MachineLocation| {
            !existing.contains(location.as_str())
                && location != self.directory.this_machine()
                && self.remote_for(location).is_some()
        };

        if let Some(predictor) = &self.copy_policy.predictor {
            if let Some(predicted) = predictor(hash) {
                if eligible(&predicted) {
                    return Some(predicted);
                }
            }
        }

        if let Some(designated) = self.copy_policy.designated.get(hash) {
            if let Some(target) = designated.iter().find(|l| eligible(*l)) {
                return Some(target.clone());
            }
        }

        let mut candidates = self
            .remotes
            .iter()
            .map(|r| r.location())
            .filter(eligible)
            .filter(|l| {
                inside_ring_hint || !self.copy_policy.local_ring.contains(l.as_str())
            })
            .collect::<Vec<_>>();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.into_iter().next()
    }

    fn remote_for(&self, location: &MachineLocation) -> Option<&R> {
        self.remotes.iter().find(|r| &r.location() == location)
    }

    /// Check each record's machine for the content. Returns the verified
    /// records and those whose state stayed unknown; absent records are
    /// purged.
    async fn verify_records(
        &self,
        hash: &ContentHash,
        records: &[LocationRecord],
    ) -> (Vec<LocationRecord>, Vec<LocationRecord>) {
        let mut verified = Vec::new();
        let mut unknown = Vec::new();
        for record in records {
            let Some(remote) = self.remote_for(&record.location) else {
                unknown.push(record.clone());
                continue;
            };
            match remote.exists(hash).await {
                Ok(true) => verified.push(record.clone()),
                Ok(false) => self.directory.purge_async(*hash, record.location.clone()),
                Err(_) => unknown.push(record.clone()),
            }
        }
        (verified, unknown)
    }

    /// The number of replicas the directory currently knows about,
    /// including this machine's own copy.
    pub async fn known_replicas(&self, hash: &ContentHash) -> Result<usize> {
        let records = self.directory.fetch_remote_records(hash).await?;
        Ok(records.len() + usize::from(self.local.contains(hash).await))
    }

    /// Copy the content into the local store from the first candidate that
    /// can serve it. Registers the new local replica on success.
    async fn copy_local(
        &self,
        hash: &ContentHash,
        candidates: &[LocationRecord],
    ) -> Result<Option<u64>> {
        // Verified locations first; among equals, directory order stands.
        let mut ordered = candidates.to_vec();
        ordered.sort_by_key(|r| r.verified_at.is_none());

        for record in &ordered {
            let Some(remote) = self.remote_for(&record.location) else {
                continue;
            };
            match remote.fetch(hash).await {
                Ok(Some(content)) => {
                    self.local.write_trusted(hash, &content).await?;
                    self.directory.mark_verified(hash, &record.location).await?;
                    self.directory.publish_self(hash).await?;
                    trace!(%hash, from = %record.location, "copied content locally");
                    return Ok(Some(content.len() as u64));
                }
                Ok(None) => {
                    self.directory.purge_async(*hash, record.location.clone());
                }
                Err(err) => {
                    if error_kind(&err) == Some(StoreErrorKind::ChecksumMismatch) {
                        // A machine serving wrong bytes is worse than one
                        // serving none.
                        self.directory.purge_async(*hash, record.location.clone());
                    }
                    warn!(%hash, from = %record.location, ?err, "copy attempt failed");
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::{directory::InMemoryGlobalDirectory, remote::InProcessPeer};
    use pretty_assertions::assert_eq as pretty_assert_eq;

    struct Cluster {
        _dir: tempfile::TempDir,
        global: InMemoryGlobalDirectory,
        peers: Vec<InProcessPeer>,
    }

    impl Cluster {
        fn new(peer_count: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let global = InMemoryGlobalDirectory::new();
            let peers = (0..peer_count)
                .map(|i| {
                    InProcessPeer::new(
                        MachineLocation::new(format!("cas://peer-{i}")),
                        LocalCas::new(dir.path().join(format!("peer-{i}"))),
                    )
                })
                .collect();
            Self {
                _dir: dir,
                global,
                peers,
            }
        }

        fn store(&self, name: &str, config: PinConfig) -> ContentStore<InProcessPeer, InMemoryGlobalDirectory> {
            ContentStore::new(
                LocalCas::new(self._dir.path().join(name)),
                MachineLocation::new(format!("cas://{name}")),
                self.global.clone(),
                self.peers.clone(),
                config,
                4,
                CancellationToken::new(),
            )
        }

        async fn seed_peer(&self, index: usize, content: &[u8]) -> ContentHash {
            let hash = ContentHash::from_buffer(content);
            self.peers[index].push(&hash, content).await.unwrap();
            self.global
                .publish(
                    &hash,
                    LocationRecord {
                        location: self.peers[index].location(),
                        verified_at: None,
                    },
                )
                .await
                .unwrap();
            hash
        }
    }

    fn lenient_pin() -> PinConfig {
        // n_u is small so record counts alone satisfy pins.
        PinConfig::builder()
            .machine_risk(0.01)
            .file_risk(0.01)
            .risk_tolerance(0.1)
            .build()
    }

    fn strict_pin() -> PinConfig {
        // n_u is large so record counts never suffice.
        PinConfig::builder()
            .machine_risk(0.3)
            .file_risk(0.3)
            .risk_tolerance(1e-6)
            .replica_threshold(2)
            .build()
    }

    #[tokio::test]
    async fn put_then_pin_is_local() {
        let cluster = Cluster::new(0);
        let store = cluster.store("m1", lenient_pin());

        let hash = store.put_buffer(b"content").await.unwrap();
        let outcome = store.pin(&hash, PinUrgency::Nominal).await.unwrap();
        pretty_assert_eq!(outcome, PinOutcome::Success(PinSource::Local));
    }

    #[tokio::test]
    async fn pin_succeeds_on_record_count() {
        let cluster = Cluster::new(3);
        let store = cluster.store("m1", lenient_pin());

        let content = b"widely replicated";
        let mut hash = None;
        for i in 0..3 {
            hash = Some(cluster.seed_peer(i, content).await);
        }
        let hash = hash.unwrap();

        let outcome = store.pin(&hash, PinUrgency::Nominal).await.unwrap();
        pretty_assert_eq!(outcome, PinOutcome::Success(PinSource::RecordCount));
        // The content was never copied locally.
        assert!(!store.local().contains(&hash).await);

        // And the pin cache answers the next pin.
        let outcome = store.pin(&hash, PinUrgency::Nominal).await.unwrap();
        pretty_assert_eq!(outcome, PinOutcome::Success(PinSource::PinCache));
    }

    #[tokio::test]
    async fn pin_below_threshold_copies_locally_and_replicates() {
        let cluster = Cluster::new(1);
        let store = cluster.store("m1", strict_pin());

        let hash = cluster.seed_peer(0, b"thin content").await;
        pretty_assert_eq!(store.known_replicas(&hash).await.unwrap(), 1);

        let outcome = store.pin(&hash, PinUrgency::Nominal).await.unwrap();
        pretty_assert_eq!(outcome, PinOutcome::Success(PinSource::LocalCopy));
        assert!(store.local().contains(&hash).await);
        assert!(store.known_replicas(&hash).await.unwrap() >= 2);
    }

    #[tokio::test]
    async fn pin_missing_content_is_not_found() {
        let cluster = Cluster::new(1);
        let store = cluster.store("m1", lenient_pin());
        let hash = ContentHash::from_buffer(b"never stored");

        let outcome = store.pin(&hash, PinUrgency::Nominal).await.unwrap();
        pretty_assert_eq!(outcome, PinOutcome::ContentNotFound);
    }

    #[tokio::test]
    async fn place_file_realizes_content() {
        let cluster = Cluster::new(1);
        let store = cluster.store("m1", lenient_pin());
        let hash = cluster.seed_peer(0, b"place me").await;

        let dst = cluster._dir.path().join("workspace").join("out.txt");
        let outcome = store
            .place_file(
                &hash,
                &dst,
                AccessMode::ReadOnly,
                ReplacementMode::FailIfExists,
                RealizationMode::Copy,
            )
            .await
            .unwrap();
        pretty_assert_eq!(outcome, PlaceOutcome::Placed { bytes: 8 });
        pretty_assert_eq!(fs::must_read_buffered(&dst).await.unwrap(), b"place me");

        // The destination exists now, so FailIfExists fails and
        // SkipIfExists skips.
        assert!(
            store
                .place_file(
                    &hash,
                    &dst,
                    AccessMode::ReadOnly,
                    ReplacementMode::FailIfExists,
                    RealizationMode::Copy,
                )
                .await
                .is_err()
        );
        let outcome = store
            .place_file(
                &hash,
                &dst,
                AccessMode::ReadOnly,
                ReplacementMode::SkipIfExists,
                RealizationMode::Copy,
            )
            .await
            .unwrap();
        pretty_assert_eq!(outcome, PlaceOutcome::SkippedExisting);
    }

    #[tokio::test]
    async fn place_missing_content_reports_not_found() {
        let cluster = Cluster::new(0);
        let store = cluster.store("m1", lenient_pin());
        let hash = ContentHash::from_buffer(b"missing");

        let outcome = store
            .place_file(
                &hash,
                &cluster._dir.path().join("never"),
                AccessMode::ReadOnly,
                ReplacementMode::FailIfExists,
                RealizationMode::Copy,
            )
            .await
            .unwrap();
        pretty_assert_eq!(outcome, PlaceOutcome::ContentNotFound);
    }

    #[tokio::test]
    async fn open_stream_copies_on_miss() {
        let cluster = Cluster::new(1);
        let store = cluster.store("m1", strict_pin());
        let hash = cluster.seed_peer(0, b"streamed").await;

        let mut reader = store.open_stream(&hash).await.unwrap().unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        pretty_assert_eq!(content, b"streamed");
        assert!(store.local().contains(&hash).await);
    }

    #[tokio::test]
    async fn bulk_pin_fast_mode_answers_from_directory() {
        let cluster = Cluster::new(1);
        let store = cluster.store("m1", strict_pin());
        let present = cluster.seed_peer(0, b"somewhere").await;
        let absent = ContentHash::from_buffer(b"nowhere");

        let results = store
            .pin_bulk(
                [present, absent],
                PinBulkOptions {
                    return_global_existence_fast: true,
                },
            )
            .await;

        let by_hash: HashMap<_, _> = results
            .into_iter()
            .map(|(h, r)| (h, r.unwrap()))
            .collect();
        pretty_assert_eq!(
            by_hash[&present],
            PinOutcome::Success(PinSource::GlobalExistence)
        );
        pretty_assert_eq!(by_hash[&absent], PinOutcome::ContentNotFound);
        // Fast existence never materializes.
        assert!(!store.local().contains(&present).await);
    }

    #[tokio::test]
    async fn verify_purges_stale_records() {
        let cluster = Cluster::new(1);
        let store = cluster.store("m1", lenient_pin());
        let hash = ContentHash::from_buffer(b"claimed but gone");

        // A record pointing at a peer that never had the content.
        let stale = cluster.peers[0].location();
        cluster
            .global
            .publish(
                &hash,
                LocationRecord {
                    location: stale.clone(),
                    verified_at: None,
                },
            )
            .await
            .unwrap();

        assert!(!store.verify(&hash, &stale).await.unwrap());
        for _ in 0..50 {
            if cluster.global.location_count(&hash) == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        pretty_assert_eq!(cluster.global.location_count(&hash), 0);
    }

    #[tokio::test]
    async fn trusted_put_skips_rehashing_but_keys_by_hint() {
        let cluster = Cluster::new(0);
        let store = cluster.store("m1", lenient_pin());

        let source = cluster._dir.path().join("artifact");
        fs::write(&source, b"trusted bytes").await.unwrap();
        let hint = ContentHash::from_buffer(b"trusted bytes");

        let (hash, len) = store
            .put_file(&source, Some((hint, 13)), IngestMode::Copy)
            .await
            .unwrap();
        pretty_assert_eq!(hash, hint);
        pretty_assert_eq!(len, 13);
        assert!(store.local().contains(&hash).await);
    }
}
