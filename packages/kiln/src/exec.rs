//! The pip executor: the per-pip state machine.
//!
//! Each pip moves through phases — cache lookup, worker choice, input
//! materialization, sandboxed execution, output processing, descriptor
//! publish — with the dispatcher gating every transition. The executor owns
//! the phase logic; the build driver in [`crate::engine`] owns the loop
//! that feeds it.
//!
//! ```text
//! Ready
//!   └─→ CacheLookup: weak fp → stored path sets → strong fp → descriptor
//!         hit  → Materialize → Cached
//!         miss → ChooseWorker → Cpu: materialize inputs, run under the
//!                monitor, process observations, ingest outputs, publish
//!                → Executed
//! ```

pub mod dedup;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use color_eyre::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use wire::ContentHash;

use crate::{
    cas::{
        AccessMode, ContentStore, PinBulkOptions, PlaceOutcome, RealizationMode,
        ReplacementMode, directory::GlobalDirectory, is_transient, local::IngestMode,
        remote::RemoteStore,
    },
    config::EngineConfig,
    dispatch::DispatcherKind,
    error::{FailureCode, MissReason, PipFailure, retry_transient},
    fingerprint::{
        FingerprintSalt, ObservationKind, PathSet, ScopeFilter, StrongFingerprint,
        WeakFingerprint, canonicalize_path_set, membership_fingerprint, strong_fingerprint,
        weak_fingerprint_of,
    },
    fs,
    graph::PipGraph,
    opaque::SharedOpaqueTracker,
    paths::PathId,
    pip::{EnvSpec, Pip, PipId, PipPayload, ProcessPip, SealKind},
    sandbox::{Monitor, ProcessSpec, policy},
    translate::DirectoryTranslator,
    twophase::{
        CacheDescriptor, DescriptorOutput, MetadataStore, ObservedInput, ReplacementBehavior,
    },
};

use self::dedup::{Claim, InFlightTable, OwnerOutcome, await_owner};

/// Relays IPC pip payloads to their service endpoints. The transport is a
/// collaborator; the engine only routes.
pub trait IpcRelay: Send + Sync + 'static {
    fn call(
        &self,
        moniker: &str,
        payload: &str,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// An IPC relay for builds with no service pips: echoes the payload.
#[derive(Clone, Debug, Default)]
pub struct NullRelay;

impl IpcRelay for NullRelay {
    async fn call(&self, _moniker: &str, payload: &str) -> Result<String> {
        Ok(payload.to_string())
    }
}

/// The terminal result of one pip.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PipOutcome {
    /// Finished from cache.
    Cached { descriptor: CacheDescriptor },
    /// Finished by executing.
    Executed {
        outputs: Vec<DescriptorOutput>,
        /// Whether a descriptor was published.
        published: bool,
        /// Whether warned violations (or configuration) made the pip
        /// uncacheable.
        uncacheable: bool,
    },
    Failed(PipFailure),
}

impl PipOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, PipOutcome::Failed(_))
    }

    /// The outputs this outcome produced, for seeding dependents.
    pub fn outputs(&self) -> &[DescriptorOutput] {
        match self {
            PipOutcome::Cached { descriptor } => &descriptor.outputs,
            PipOutcome::Executed { outputs, .. } => outputs,
            PipOutcome::Failed(_) => &[],
        }
    }
}

/// What a phase asks the driver to do next.
#[derive(Debug)]
pub enum PhaseResult {
    /// Requeue under this dispatcher kind.
    Continue(DispatcherKind),
    /// The pip is terminal.
    Done(PipOutcome),
}

/// Cache and execution counters for one build.
#[derive(Debug, Default)]
pub struct BuildCounters {
    pub cache_hits: AtomicU64,
    pub executed: AtomicU64,
    /// Lookups that found no path sets for the weak fingerprint.
    pub weak_fingerprint_misses: AtomicU64,
    /// Lookups that found path sets but no matching strong fingerprint.
    pub strong_fingerprint_misses: AtomicU64,
    miss_reasons: DashMap<MissReason, u64>,
}

impl BuildCounters {
    pub fn note_miss(&self, reason: MissReason) {
        *self.miss_reasons.entry(reason).or_insert(0) += 1;
    }

    pub fn miss_reasons(&self) -> BTreeMap<MissReason, u64> {
        self.miss_reasons
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }
}

/// The marker value hashed for observations that carry existence but no
/// content (probes that found the path).
fn exists_marker() -> ContentHash {
    ContentHash::from_buffer(b"\x00exists\x00")
}

#[derive(Default)]
struct Scratch {
    weak: Option<WeakFingerprint>,
    hit: Option<(CacheDescriptor, PathSet)>,
    owner: Option<dedup::OwnerGuard>,
}

/// The per-pip state machine over the shared build services.
pub struct PipExecutor<M, R, G, I = NullRelay> {
    graph: Arc<PipGraph>,
    store: ContentStore<R, G>,
    metadata: Arc<MetadataStore>,
    monitor: Arc<M>,
    ipc: Arc<I>,
    translator: Arc<DirectoryTranslator>,
    scope_filter: ScopeFilter,
    config: Arc<EngineConfig>,
    salt: FingerprintSalt,
    session_id: Uuid,
    tracker: SharedOpaqueTracker,
    dedup: InFlightTable,
    /// First observed producer per output path.
    produced_paths: DashMap<String, PipId>,
    /// Pips retroactively failed by a later double-write claim. A revoked
    /// pip never publishes, and a success it already reported is converted
    /// to a failure at the phase boundary (or by the driver, if it had
    /// already finished).
    revoked: DashMap<PipId, PipFailure>,
    revocations_tx: flume::Sender<(PipId, PipFailure)>,
    revocations_rx: flume::Receiver<(PipId, PipFailure)>,
    /// Known content hashes of artifacts, keyed by rendered canonical path
    /// (post-translation), so hashes learned from descriptors, local
    /// execution, and remote manifests all land in one namespace.
    artifact_hashes: DashMap<String, ContentHash>,
    scratch: DashMap<PipId, Scratch>,
    counters: Arc<BuildCounters>,
    cancel: CancellationToken,
}

impl<M, R, G, I> PipExecutor<M, R, G, I>
where
    M: Monitor,
    R: RemoteStore,
    G: GlobalDirectory,
    I: IpcRelay,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<PipGraph>,
        store: ContentStore<R, G>,
        metadata: Arc<MetadataStore>,
        monitor: Arc<M>,
        ipc: Arc<I>,
        translator: Arc<DirectoryTranslator>,
        config: Arc<EngineConfig>,
        session_id: Uuid,
        tracker: SharedOpaqueTracker,
        counters: Arc<BuildCounters>,
        cancel: CancellationToken,
    ) -> Self {
        let scope_filter = ScopeFilter::new(config.untracked_mounts.iter().cloned());
        let salt = config.fingerprint_salt.clone();
        let (revocations_tx, revocations_rx) = flume::unbounded();
        Self {
            graph,
            store,
            metadata,
            monitor,
            ipc,
            translator,
            scope_filter,
            config,
            salt,
            session_id,
            tracker,
            dedup: InFlightTable::new(),
            produced_paths: DashMap::new(),
            revoked: DashMap::new(),
            revocations_tx,
            revocations_rx,
            artifact_hashes: DashMap::new(),
            scratch: DashMap::new(),
            counters,
            cancel,
        }
    }

    /// Revocations raised against pips that already finished: the driver
    /// subscribes and retroactively fails them.
    pub fn revocations(&self) -> flume::Receiver<(PipId, PipFailure)> {
        self.revocations_rx.clone()
    }

    /// The shared-opaque tracker this executor records into.
    pub fn tracker(&self) -> &SharedOpaqueTracker {
        &self.tracker
    }

    /// Record the content hash of an artifact by its rendered canonical
    /// path. Seeded by sources on demand, by outputs as producers finish,
    /// and by artifact manifests on distributed workers.
    pub fn record_artifact_hash(&self, path: impl Into<String>, hash: ContentHash) {
        self.artifact_hashes.insert(path.into(), hash);
    }

    /// The dispatcher kind a pip starts on.
    pub fn initial_kind(pip: &Pip) -> DispatcherKind {
        match pip.payload {
            PipPayload::Process(_) | PipPayload::WriteFile(_) | PipPayload::CopyFile(_) => {
                DispatcherKind::CacheLookup
            }
            PipPayload::Ipc(_) => DispatcherKind::ChooseWorkerIpc,
            PipPayload::SealDirectory(_) | PipPayload::Meta => DispatcherKind::Light,
        }
    }

    /// Run one phase of the pip's state machine.
    #[instrument(name = "PipExecutor::run_phase", skip(self))]
    pub async fn run_phase(&self, pip_id: PipId, kind: DispatcherKind) -> PhaseResult {
        if self.cancel.is_cancelled() {
            self.scratch.remove(&pip_id);
            return PhaseResult::Done(PipOutcome::Failed(PipFailure::canceled()));
        }

        let pip = match self.graph.pip(pip_id) {
            Ok(pip) => pip.clone(),
            Err(err) => {
                return PhaseResult::Done(PipOutcome::Failed(PipFailure::internal(format!(
                    "{err:#}"
                ))));
            }
        };

        let result = match kind {
            DispatcherKind::CacheLookup | DispatcherKind::DelayedCacheLookup => {
                self.phase_cache_lookup(&pip).await
            }
            DispatcherKind::Materialize => self.phase_materialize_hit(&pip).await,
            DispatcherKind::ChooseWorkerCacheLookup => {
                Ok(PhaseResult::Continue(DispatcherKind::CacheLookup))
            }
            // Worker choice is the driver's concern; reaching the executor
            // means the pip runs here.
            DispatcherKind::ChooseWorkerCpu => Ok(PhaseResult::Continue(DispatcherKind::Cpu)),
            DispatcherKind::ChooseWorkerLight => Ok(PhaseResult::Continue(DispatcherKind::Io)),
            DispatcherKind::ChooseWorkerIpc => {
                Ok(PhaseResult::Continue(DispatcherKind::IpcPips))
            }
            DispatcherKind::Cpu => self.phase_execute(&pip).await,
            DispatcherKind::Io | DispatcherKind::Light => self.phase_execute(&pip).await,
            DispatcherKind::IpcPips => self.phase_execute(&pip).await,
        };

        match result {
            Ok(phase) => {
                // A sibling's double-write claim may have revoked this pip
                // mid-phase; its success must not stand.
                let phase = match phase {
                    PhaseResult::Done(outcome) if outcome.is_success() => {
                        match self.revoked.get(&pip_id).map(|f| f.value().clone()) {
                            Some(failure) => PhaseResult::Done(PipOutcome::Failed(failure)),
                            None => PhaseResult::Done(outcome),
                        }
                    }
                    phase => phase,
                };
                if let PhaseResult::Done(outcome) = &phase {
                    self.finish(pip_id, outcome);
                }
                phase
            }
            Err(err) => {
                let failure = self.classify_failure(&err);
                warn!(%pip_id, ?err, "pip phase failed");
                let outcome = PipOutcome::Failed(failure);
                self.finish(pip_id, &outcome);
                PhaseResult::Done(outcome)
            }
        }
    }

    fn finish(&self, pip_id: PipId, outcome: &PipOutcome) {
        if let Some((_, scratch)) = self.scratch.remove(&pip_id) {
            if let Some(owner) = scratch.owner {
                let announced = match outcome {
                    PipOutcome::Cached { .. } => OwnerOutcome::Published,
                    PipOutcome::Executed { published, .. } => {
                        if *published {
                            OwnerOutcome::Published
                        } else {
                            OwnerOutcome::NotPublished
                        }
                    }
                    PipOutcome::Failed(_) => OwnerOutcome::NotPublished,
                };
                owner.complete(announced);
            }
        }

        // Seed dependents with the produced hashes.
        for output in outcome.outputs() {
            self.artifact_hashes.insert(output.path.clone(), output.hash);
        }
    }

    fn classify_failure(&self, err: &color_eyre::Report) -> PipFailure {
        use crate::cas::{StoreErrorKind, error_kind};
        match error_kind(err) {
            Some(StoreErrorKind::Canceled) => PipFailure::canceled(),
            Some(StoreErrorKind::RemoteTransient) | Some(StoreErrorKind::ContentNotFound) => {
                PipFailure::infrastructure(FailureCode::StoreUnavailable, format!("{err:#}"))
            }
            _ => {
                if let Some(failure) = err.downcast_ref::<PipFailure>() {
                    failure.clone()
                } else {
                    PipFailure::infrastructure(FailureCode::StoreUnavailable, format!("{err:#}"))
                }
            }
        }
    }

    // ── Cache lookup ────────────────────────────────────────────────────

    async fn phase_cache_lookup(&self, pip: &Pip) -> Result<PhaseResult> {
        let weak = self.weak_fingerprint(pip).await?;
        trace!(pip = %pip.id, %weak, "computed weak fingerprint");

        let mut scratch = Scratch {
            weak: Some(weak),
            ..Scratch::default()
        };

        // At-most-one build per fingerprint: followers wait for the owner,
        // then re-read the cache the owner just populated.
        match self.dedup.claim(weak) {
            Claim::Owner(owner) => scratch.owner = Some(owner),
            Claim::Follower(receiver) => {
                trace!(pip = %pip.id, %weak, "following in-flight fingerprint");
                let outcome = await_owner(receiver).await;
                if outcome == OwnerOutcome::Published {
                    if let Some(hit) = self.try_hit(pip, &weak).await? {
                        scratch.hit = Some(hit);
                        self.scratch.insert(pip.id, scratch);
                        return Ok(PhaseResult::Continue(DispatcherKind::Materialize));
                    }
                }
                // The owner failed or the descriptor is unusable; build
                // independently, claiming ownership for any later twins.
                if let Claim::Owner(owner) = self.dedup.claim(weak) {
                    scratch.owner = Some(owner);
                }
            }
        }

        if self.lookup_disabled(pip) {
            self.scratch.insert(pip.id, scratch);
            return Ok(PhaseResult::Continue(self.execution_kind(pip)));
        }

        if let Some(hit) = self.try_hit(pip, &weak).await? {
            scratch.hit = Some(hit);
            self.scratch.insert(pip.id, scratch);
            return Ok(PhaseResult::Continue(DispatcherKind::Materialize));
        }

        self.scratch.insert(pip.id, scratch);
        Ok(PhaseResult::Continue(match pip.payload {
            PipPayload::Process(_) => DispatcherKind::ChooseWorkerCpu,
            PipPayload::Ipc(_) => DispatcherKind::ChooseWorkerIpc,
            _ => DispatcherKind::ChooseWorkerLight,
        }))
    }

    fn lookup_disabled(&self, pip: &Pip) -> bool {
        pip.as_process().is_some_and(|p| p.disable_cache_lookup)
    }

    fn execution_kind(&self, pip: &Pip) -> DispatcherKind {
        match pip.payload {
            PipPayload::Process(_) => DispatcherKind::ChooseWorkerCpu,
            PipPayload::Ipc(_) => DispatcherKind::ChooseWorkerIpc,
            _ => DispatcherKind::ChooseWorkerLight,
        }
    }

    /// Try every stored path set for the weak fingerprint, in order.
    async fn try_hit(
        &self,
        pip: &Pip,
        weak: &WeakFingerprint,
    ) -> Result<Option<(CacheDescriptor, PathSet)>> {
        let path_sets = match self.metadata.get_path_sets(weak) {
            Ok(path_sets) => path_sets,
            Err(err) => {
                warn!(?err, "path-set lookup failed; treating as miss");
                self.counters.note_miss(MissReason::CacheFailure);
                return Ok(None);
            }
        };

        if path_sets.is_empty() {
            self.counters
                .weak_fingerprint_misses
                .fetch_add(1, Ordering::Relaxed);
            let reason = match self.metadata.last_pip_weak(pip.semi_stable_hash.0) {
                Ok(Some(previous)) if previous != *weak => MissReason::FingerprintChanged,
                Ok(Some(_)) | Ok(None) => MissReason::NoPreviousRunToCheck,
                Err(_) => MissReason::CacheFailure,
            };
            self.counters.note_miss(reason);
            return Ok(None);
        }

        let mut descriptor_missing = false;
        let mut outputs_unavailable = false;
        for path_set in path_sets {
            let observed_hashes = self.current_observation_values(&path_set).await;
            let strong = strong_fingerprint(weak, &path_set, &observed_hashes);

            let descriptor = match self.metadata.get_descriptor(weak, &strong) {
                Ok(Some(descriptor)) => descriptor,
                Ok(None) => {
                    descriptor_missing = true;
                    continue;
                }
                Err(err) => {
                    warn!(?err, "descriptor lookup failed; treating as miss");
                    self.counters.note_miss(MissReason::CacheFailure);
                    return Ok(None);
                }
            };

            if self.outputs_available(&strong, &descriptor).await? {
                self.metadata.note_path_set_used(weak, &path_set)?;
                return Ok(Some((descriptor, path_set)));
            }
            outputs_unavailable = true;
        }

        if descriptor_missing || !outputs_unavailable {
            self.counters
                .strong_fingerprint_misses
                .fetch_add(1, Ordering::Relaxed);
            self.counters.note_miss(MissReason::FingerprintChanged);
        } else {
            self.counters.note_miss(MissReason::CacheFailure);
        }
        Ok(None)
    }

    /// What each observation in the path set would observe right now, in
    /// path-set order. Entries are `None` where the observation would find
    /// nothing (a missing file, a still-absent path).
    async fn current_observation_values(
        &self,
        path_set: &PathSet,
    ) -> Vec<Option<ContentHash>> {
        let mut values = Vec::with_capacity(path_set.len());
        for observation in path_set.observations() {
            let path = Path::new(&observation.path);
            let value = match &observation.kind {
                ObservationKind::FileContent => match fs::hash_file(path).await {
                    Ok((hash, _)) => Some(hash),
                    Err(_) => None,
                },
                ObservationKind::ExistenceProbe => {
                    fs::exists(path).await.then(exists_marker)
                }
                ObservationKind::AbsentPathProbe => {
                    if fs::exists(path).await {
                        Some(exists_marker())
                    } else {
                        None
                    }
                }
                ObservationKind::DirectoryEnumeration { .. } => {
                    match fs::enumerate_sorted(path).await {
                        Ok(members) => Some(membership_fingerprint(&members)),
                        // An absent directory enumerates as empty, exactly
                        // as the monitor reports it.
                        Err(_) => Some(membership_fingerprint(&[])),
                    }
                }
            };
            values.push(value);
        }
        values
    }

    /// Whether the descriptor's outputs are available, honoring the pin
    /// elision hint.
    async fn outputs_available(
        &self,
        strong: &StrongFingerprint,
        descriptor: &CacheDescriptor,
    ) -> Result<bool> {
        if let Some(window) = self.metadata.pin_elision_hint(strong)? {
            trace!(?window, "pin elided by descriptor age");
            return Ok(true);
        }

        let results = self
            .store
            .pin_bulk(
                descriptor.outputs.iter().map(|o| o.hash),
                PinBulkOptions::default(),
            )
            .await;
        Ok(results.into_iter().all(|(_, result)| {
            matches!(result, Ok(outcome) if outcome.is_success())
        }))
    }

    // ── Materialization of cache hits ───────────────────────────────────

    async fn phase_materialize_hit(&self, pip: &Pip) -> Result<PhaseResult> {
        let Some(mut scratch) = self.scratch.get_mut(&pip.id) else {
            return Err(PipFailure::internal("materialize with no lookup state").into_report());
        };
        let Some((descriptor, _)) = scratch.hit.take() else {
            return Err(PipFailure::internal("materialize without a hit").into_report());
        };
        drop(scratch);

        for output in &descriptor.outputs {
            self.claim_output(pip.id, &output.path)?;
            let outcome = self
                .store
                .place_file(
                    &output.hash,
                    Path::new(&output.path),
                    AccessMode::ReadOnly,
                    ReplacementMode::ReplaceExisting,
                    RealizationMode::Hardlink,
                )
                .await?;
            if !matches!(outcome, PlaceOutcome::Placed { .. }) {
                // The pin promised availability moments ago; a vanished
                // output here is an infrastructure fault, not a user error.
                return Err(PipFailure::infrastructure(
                    FailureCode::StoreUnavailable,
                    format!("cached output disappeared: {}", output.path),
                )
                .into_report());
            }
        }

        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.counters.note_miss(MissReason::NoMiss);
        debug!(pip = %pip.id, "cache hit materialized");
        Ok(PhaseResult::Done(PipOutcome::Cached { descriptor }))
    }

    // ── Execution ───────────────────────────────────────────────────────

    async fn phase_execute(&self, pip: &Pip) -> Result<PhaseResult> {
        let weak = match self.scratch.get(&pip.id).and_then(|s| s.weak) {
            Some(weak) => weak,
            // Light pips (seal, meta) skip the lookup phase entirely.
            None => self.weak_fingerprint(pip).await?,
        };

        let outcome = match &pip.payload {
            PipPayload::Process(process) => {
                self.execute_process(pip, process, &weak).await?
            }
            PipPayload::WriteFile(write) => {
                let destination = self.resolve(write.destination.path);
                self.claim_output(pip.id, &destination.to_string_lossy())?;
                fs::write(&destination, write.contents.as_bytes()).await?;
                let hash = ContentHash::from_buffer(write.contents.as_bytes());
                let len = write.contents.len() as u64;
                self.store
                    .put_file(&destination, Some((hash, len)), IngestMode::Hardlink)
                    .await?;
                let outputs = vec![DescriptorOutput {
                    path: destination.to_string_lossy().into_owned(),
                    hash,
                    rewrite_count: write.destination.rewrite_count,
                }];
                self.publish(pip, &weak, PathSet::default(), &[], outputs).await?
            }
            PipPayload::CopyFile(copy) => {
                let source = self.resolve(copy.source.path);
                let destination = self.resolve(copy.destination.path);
                self.claim_output(pip.id, &destination.to_string_lossy())?;

                // The copy's bytes are the source's bytes: ingest once,
                // place with the trusted hash.
                let (hash, _) = self
                    .store
                    .put_file(&source, None, IngestMode::Hardlink)
                    .await?;
                let placed = self
                    .store
                    .place_file(
                        &hash,
                        &destination,
                        AccessMode::ReadOnly,
                        ReplacementMode::ReplaceExisting,
                        RealizationMode::Copy,
                    )
                    .await?;
                if !matches!(placed, PlaceOutcome::Placed { .. }) {
                    return Err(PipFailure::user(
                        FailureCode::MissingDeclaredInput,
                        format!("copy source unavailable: {source:?}"),
                    )
                    .into_report());
                }
                let outputs = vec![DescriptorOutput {
                    path: destination.to_string_lossy().into_owned(),
                    hash,
                    rewrite_count: copy.destination.rewrite_count,
                }];
                self.publish(pip, &weak, PathSet::default(), &[], outputs).await?
            }
            PipPayload::Ipc(ipc) => {
                let response = self.ipc.call(&ipc.moniker, &ipc.payload).await?;
                let mut outputs = Vec::new();
                for artifact in &ipc.outputs {
                    let path = self.resolve(artifact.path);
                    self.claim_output(pip.id, &path.to_string_lossy())?;
                    fs::write(&path, response.as_bytes()).await?;
                    let (hash, _) = self
                        .store
                        .put_file(&path, None, IngestMode::Hardlink)
                        .await?;
                    outputs.push(DescriptorOutput {
                        path: path.to_string_lossy().into_owned(),
                        hash,
                        rewrite_count: artifact.rewrite_count,
                    });
                }
                self.publish(pip, &weak, PathSet::default(), &[], outputs).await?
            }
            PipPayload::SealDirectory(_) | PipPayload::Meta => PipOutcome::Executed {
                outputs: Vec::new(),
                published: false,
                uncacheable: false,
            },
        };

        if outcome.is_success() {
            self.counters.executed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(PhaseResult::Done(outcome))
    }

    async fn execute_process(
        &self,
        pip: &Pip,
        process: &ProcessPip,
        weak: &WeakFingerprint,
    ) -> Result<PipOutcome> {
        self.materialize_inputs(process).await?;

        // Stale declared outputs (possibly read-only hardlinks from a prior
        // materialization) would block the tool's writes.
        for artifact in &process.outputs {
            fs::remove_file_if_exists(self.resolve(artifact.path)).await?;
        }

        let spec = self.process_spec(process).await?;
        let observed = self
            .monitor
            .launch(spec.clone())
            .await?
            .collect()
            .await?;

        if observed.exit_code != 0 {
            return Ok(PipOutcome::Failed(PipFailure::user(
                FailureCode::ToolFailed,
                format!("tool exited with code {}", observed.exit_code),
            )));
        }

        let verdict = policy::evaluate(
            &spec,
            &observed,
            &self.config.sandbox.breakaway,
            self.config.sandbox.violations_are_warnings,
        );

        if verdict.has_blocking_violations() {
            let first = &verdict.violations[0];
            let code = match first.kind {
                policy::ViolationKind::UndeclaredWrite => FailureCode::UndeclaredOutput,
                policy::ViolationKind::DisallowedRead => FailureCode::DisallowedRead,
            };
            return Ok(PipOutcome::Failed(PipFailure::user(
                code,
                format!(
                    "{} violation(s); first: {} {:?}",
                    verdict.violations.len(),
                    first.kind,
                    first.path
                ),
            )));
        }
        let uncacheable = verdict.is_uncacheable();
        if uncacheable {
            // Exactly one warning per pip, regardless of violation count.
            warn!(
                pip = %pip.id,
                violations = verdict.violations.len(),
                "file monitoring violations (warning mode); pip is uncacheable"
            );
        }

        // Outputs: everything declared, plus dynamic writes under opaque
        // output directories.
        let mut outputs = Vec::new();
        for artifact in &process.outputs {
            let path = self.resolve(artifact.path);
            let rendered = path.to_string_lossy().into_owned();
            self.claim_output(pip.id, &rendered)?;
            if !fs::is_file(&path).await {
                return Ok(PipOutcome::Failed(PipFailure::user(
                    FailureCode::ToolFailed,
                    format!("declared output was not produced: {rendered}"),
                )));
            }
            let (hash, _) = self
                .store
                .put_file(&path, None, IngestMode::Hardlink)
                .await?;
            outputs.push(DescriptorOutput {
                path: rendered,
                hash,
                rewrite_count: artifact.rewrite_count,
            });
        }

        let opaque_roots = self.opaque_roots(process);
        let shared_opaque_roots = self.shared_opaque_roots(process);
        for written in &verdict.written_paths {
            let translated = self.translator.translate(written);
            if !opaque_roots.iter().any(|root| translated.starts_with(root)) {
                continue;
            }
            let rendered = translated.to_string_lossy().into_owned();
            if outputs.iter().any(|o| o.path == rendered) {
                continue;
            }
            self.claim_output(pip.id, &rendered)?;
            let (hash, _) = self
                .store
                .put_file(&translated, None, IngestMode::Hardlink)
                .await?;
            outputs.push(DescriptorOutput {
                path: rendered,
                hash,
                rewrite_count: 1,
            });
        }

        // Mark and record shared-opaque outputs for the next build's scrub.
        if !shared_opaque_roots.is_empty() {
            let produced = outputs
                .iter()
                .map(|o| PathBuf::from(&o.path))
                .filter(|p| shared_opaque_roots.iter().any(|root| p.starts_with(root)))
                .collect::<Vec<_>>();
            if !produced.is_empty() {
                self.tracker
                    .record_outputs(
                        pip.semi_stable_hash,
                        &shared_opaque_roots,
                        produced.iter().map(PathBuf::as_path),
                    )
                    .await?;
            }
        }

        // Build the observed path set and its content values.
        let path_set = canonicalize_path_set(
            verdict.observations.iter().cloned(),
            &self.translator,
            &self.scope_filter,
        );
        let mut observed_values = Vec::with_capacity(path_set.len());
        let mut observed_inputs = Vec::with_capacity(path_set.len());
        for observation in path_set.observations() {
            let value = match &observation.kind {
                ObservationKind::FileContent => {
                    let path = PathBuf::from(&observation.path);
                    match verdict.observed_hashes.get(&path) {
                        Some(hash) => Some(*hash),
                        None => match fs::hash_file(&path).await {
                            Ok((hash, _)) => Some(hash),
                            Err(_) => None,
                        },
                    }
                }
                ObservationKind::ExistenceProbe => Some(exists_marker()),
                ObservationKind::AbsentPathProbe => None,
                ObservationKind::DirectoryEnumeration { membership } => Some(*membership),
            };
            observed_inputs.push(ObservedInput {
                path: observation.path.clone(),
                kind: observation.kind.clone(),
                hash: value,
            });
            observed_values.push(value);
        }

        if uncacheable || self.lookup_disabled(pip) {
            return Ok(PipOutcome::Executed {
                outputs,
                published: false,
                uncacheable,
            });
        }

        let strong = strong_fingerprint(weak, &path_set, &observed_values);
        self.publish_descriptor(pip, weak, &path_set, &strong, &observed_inputs, outputs)
            .await
    }

    /// Publish for the simple pip kinds with an empty observed set.
    async fn publish(
        &self,
        pip: &Pip,
        weak: &WeakFingerprint,
        path_set: PathSet,
        observed_inputs: &[ObservedInput],
        outputs: Vec<DescriptorOutput>,
    ) -> Result<PipOutcome> {
        let strong = strong_fingerprint(weak, &path_set, &[]);
        self.publish_descriptor(pip, weak, &path_set, &strong, observed_inputs, outputs)
            .await
    }

    async fn publish_descriptor(
        &self,
        pip: &Pip,
        weak: &WeakFingerprint,
        path_set: &PathSet,
        strong: &StrongFingerprint,
        observed_inputs: &[ObservedInput],
        outputs: Vec<DescriptorOutput>,
    ) -> Result<PipOutcome> {
        // A revoked pip must not put its descriptor where later builds (or
        // in-flight followers) would reuse it.
        if let Some(failure) = self.revoked.get(&pip.id).map(|f| f.value().clone()) {
            return Ok(PipOutcome::Failed(failure));
        }

        let descriptor = CacheDescriptor {
            weak: *weak,
            strong: *strong,
            outputs: outputs.clone(),
            observed_inputs: observed_inputs.to_vec(),
            trace_info: self.config.trace_info.clone(),
            session_id: self.session_id,
            stored_at: jiff::Timestamp::now(),
        };

        let retry = self.config.retry;
        let published = retry_transient(
            retry.attempts,
            retry.initial_delay,
            is_transient,
            || async {
                self.metadata.publish(
                    weak,
                    path_set,
                    strong,
                    &descriptor,
                    ReplacementBehavior::ElideIfEquivalent,
                )
            },
        )
        .await;

        match published {
            Ok(_) => {
                self.metadata.note_pip_weak(pip.semi_stable_hash.0, weak)?;
                Ok(PipOutcome::Executed {
                    outputs,
                    published: true,
                    uncacheable: false,
                })
            }
            Err(err) => {
                // A publish failure costs the next build a rebuild, not
                // this build its result.
                warn!(?err, "descriptor publish failed; result unpublished");
                Ok(PipOutcome::Executed {
                    outputs,
                    published: false,
                    uncacheable: false,
                })
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn resolve(&self, path: PathId) -> PathBuf {
        self.translator
            .translate(&self.graph.paths().resolve(path))
    }

    /// Claim an output path for this pip.
    ///
    /// A second producer is a double write, and a double write has no
    /// innocent side: the later claimant fails here, and the first
    /// claimant is revoked — it never publishes, and a success it already
    /// reported is retroactively failed by the driver.
    fn claim_output(&self, pip: PipId, path: &str) -> Result<()> {
        match self.produced_paths.entry(path.to_string()) {
            dashmap::Entry::Vacant(slot) => {
                slot.insert(pip);
                Ok(())
            }
            dashmap::Entry::Occupied(entry) if *entry.get() == pip => Ok(()),
            dashmap::Entry::Occupied(entry) => {
                let first = *entry.get();
                drop(entry);
                self.revoke(
                    first,
                    PipFailure::user(
                        FailureCode::InvalidOutputDueToSimpleDoubleWrite,
                        format!("output {path} also produced by {pip}"),
                    ),
                );
                Err(PipFailure::user(
                    FailureCode::InvalidOutputDueToSimpleDoubleWrite,
                    format!("output {path} already produced by {first}"),
                )
                .into_report())
            }
        }
    }

    fn revoke(&self, pip: PipId, failure: PipFailure) {
        warn!(%pip, %failure, "revoking earlier producer");
        self.revoked.insert(pip, failure.clone());
        // Send only fails when the driver is gone, and then there is
        // nobody left to retro-fail.
        let _ = self.revocations_tx.send((pip, failure));
    }

    async fn weak_fingerprint(&self, pip: &Pip) -> Result<WeakFingerprint> {
        let mut declared_hashes = BTreeMap::new();
        for artifact in pip.declared_file_inputs() {
            let path = self.resolve(artifact.path);
            let rendered = path.to_string_lossy().into_owned();
            if let Some(hash) = self.artifact_hashes.get(&rendered) {
                declared_hashes.insert(artifact.path, *hash);
                continue;
            }
            match fs::hash_file(&path).await {
                Ok((hash, _)) => {
                    self.artifact_hashes.insert(rendered, hash);
                    declared_hashes.insert(artifact.path, hash);
                }
                Err(err) if artifact.is_source() => {
                    return Err(PipFailure::user(
                        FailureCode::MissingDeclaredInput,
                        format!("missing declared input {path:?}: {err:#}"),
                    )
                    .into_report());
                }
                Err(_) => {
                    // An output of an upstream pip that has not produced
                    // yet; the unset marker keeps the fingerprint total.
                }
            }
        }
        Ok(weak_fingerprint_of(
            pip,
            self.graph.paths(),
            &declared_hashes,
            &self.salt,
        ))
    }

    async fn materialize_inputs(&self, process: &ProcessPip) -> Result<()> {
        for artifact in &process.inputs {
            let path = self.resolve(artifact.path);
            if artifact.is_source() {
                if !fs::is_file(&path).await {
                    return Err(PipFailure::user(
                        FailureCode::MissingDeclaredInput,
                        format!("missing declared input {path:?}"),
                    )
                    .into_report());
                }
                continue;
            }

            // Produced input: realize it from the store when the producer
            // ran elsewhere (or its output was cleaned).
            let rendered = path.to_string_lossy().into_owned();
            let Some(hash) = self.artifact_hashes.get(&rendered).map(|h| *h) else {
                return Err(PipFailure::internal(format!(
                    "no recorded hash for produced input {path:?}"
                ))
                .into_report());
            };
            let placed = self
                .store
                .place_file(
                    &hash,
                    &path,
                    AccessMode::ReadOnly,
                    ReplacementMode::SkipIfExists,
                    RealizationMode::Hardlink,
                )
                .await?;
            if matches!(placed, PlaceOutcome::ContentNotFound) {
                return Err(PipFailure::infrastructure(
                    FailureCode::StoreUnavailable,
                    format!("produced input unavailable: {path:?}"),
                )
                .into_report());
            }
        }
        Ok(())
    }

    async fn process_spec(&self, process: &ProcessPip) -> Result<ProcessSpec> {
        let mut env = BTreeMap::new();
        for (name, spec) in &process.env {
            match spec {
                EnvSpec::Tracked(Some(value)) => {
                    env.insert(name.clone(), value.clone());
                }
                EnvSpec::Tracked(None) => {}
                EnvSpec::Passthrough => {
                    if let Ok(value) = std::env::var(name) {
                        env.insert(name.clone(), value);
                    }
                }
            }
        }

        let mut output_roots = process
            .outputs
            .iter()
            .map(|a| self.resolve(a.path))
            .collect::<Vec<_>>();
        output_roots.extend(process.output_dirs.iter().map(|d| self.resolve(d.path)));

        Ok(ProcessSpec::builder()
            .executable(self.resolve(process.executable))
            .arguments(process.arguments.clone())
            .working_dir(self.resolve(process.working_dir))
            .env(env)
            .declared_inputs(
                process
                    .inputs
                    .iter()
                    .map(|a| self.resolve(a.path))
                    .collect(),
            )
            .output_roots(output_roots)
            .untracked_scopes(
                process
                    .untracked_scopes
                    .iter()
                    .map(|p| self.resolve(*p))
                    .collect(),
            )
            .allowed_scopes(
                process
                    .allowed_undeclared_scopes
                    .iter()
                    .map(|p| self.resolve(*p))
                    .collect(),
            )
            .build())
    }

    fn opaque_roots(&self, process: &ProcessPip) -> Vec<PathBuf> {
        process
            .output_dirs
            .iter()
            .filter(|d| d.kind.is_opaque())
            .map(|d| self.resolve(d.path))
            .collect()
    }

    fn shared_opaque_roots(&self, process: &ProcessPip) -> Vec<PathBuf> {
        process
            .output_dirs
            .iter()
            .filter(|d| d.kind == SealKind::SharedOpaque)
            .map(|d| self.resolve(d.path))
            .collect()
    }
}

impl PipFailure {
    /// Wrap the failure in a report so it travels through `?` like any
    /// other error and is recovered by classification at the phase
    /// boundary.
    fn into_report(self) -> color_eyre::Report {
        color_eyre::eyre::eyre!(self)
    }
}
