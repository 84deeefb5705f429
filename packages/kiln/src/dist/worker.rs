//! The worker role.
//!
//! A worker advertises itself to the orchestrator, receives the build
//! session context at attach, executes the pip batches it is handed through
//! its own dispatcher, and streams results back under monotonic sequence
//! numbers. Losing the orchestrator (consecutive heartbeat delivery
//! failures) moves the worker to the Terminating state; the host wrapper
//! is expected to exit non-zero from there.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bon::Builder;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use wire::{
    ContentType,
    dist::v1::{
        Attach, AttachCompleted, EventCounts, ExecutePips, Exit, Heartbeat, Hello,
        HelloResponse, MachineLocation, PipResult, PipTimings, ReportPipResults, WorkerId,
        decode, encode,
    },
};

use crate::{
    cas::{ContentStore, directory::GlobalDirectory, remote::RemoteStore},
    config::EngineConfig,
    dispatch::{Dispatcher, DispatcherKind},
    error::PipFailure,
    exec::{BuildCounters, IpcRelay, PhaseResult, PipExecutor, PipOutcome},
    fingerprint::FingerprintSalt,
    graph::PipGraphBuilder,
    opaque::SharedOpaqueTracker,
    paths::PathTable,
    pip::PipId,
    sandbox::Monitor,
    translate::DirectoryTranslator,
    twophase::MetadataStore,
};

use super::{intern_payload, perf_snapshot, PortablePip};

/// How many consecutive heartbeat failures mean the orchestrator is gone.
const ORCHESTRATOR_LOST_AFTER: u32 = 3;

/// Worker settings.
#[derive(Clone, Debug, Builder)]
pub struct WorkerConfig {
    /// Where this worker's own services are reachable.
    pub location: MachineLocation,
    /// The orchestrator's base URL.
    pub orchestrator: String,
    #[builder(default = Duration::from_secs(5))]
    pub heartbeat_interval: Duration,
    /// Where per-pip sideband logs live on this worker.
    pub sideband_dir: PathBuf,
}

/// The worker service state.
pub struct WorkerService<M, R, G, I> {
    config: WorkerConfig,
    engine_config: Arc<EngineConfig>,
    store: ContentStore<R, G>,
    metadata: Arc<MetadataStore>,
    monitor: Arc<M>,
    ipc: Arc<I>,
    translator: Arc<DirectoryTranslator>,
    client: reqwest::Client,
    orchestrator_base: Url,
    id: Mutex<Option<WorkerId>>,
    session: Mutex<Option<Attach>>,
    result_sequence: AtomicU64,
    heartbeat_failures: AtomicU32,
    terminating: AtomicBool,
    counts: Mutex<EventCounts>,
    cancel: CancellationToken,
}

impl<M, R, G, I> WorkerService<M, R, G, I>
where
    M: Monitor,
    R: RemoteStore,
    G: GlobalDirectory,
    I: IpcRelay,
{
    pub fn new(
        config: WorkerConfig,
        engine_config: Arc<EngineConfig>,
        store: ContentStore<R, G>,
        metadata: Arc<MetadataStore>,
        monitor: Arc<M>,
        ipc: Arc<I>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let translator = Arc::new(engine_config.sealed_translator()?);
        let orchestrator_base = Url::parse(&config.orchestrator)
            .with_context(|| format!("parse orchestrator url {}", config.orchestrator))?;
        Ok(Arc::new(Self {
            config,
            engine_config,
            store,
            metadata,
            monitor,
            ipc,
            translator,
            client: reqwest::Client::new(),
            orchestrator_base,
            id: Mutex::new(None),
            session: Mutex::new(None),
            result_sequence: AtomicU64::new(0),
            heartbeat_failures: AtomicU32::new(0),
            terminating: AtomicBool::new(false),
            counts: Mutex::new(EventCounts::default()),
            cancel,
        }))
    }

    /// Whether the worker is shutting down.
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// The id assigned by the orchestrator, once attached.
    pub fn id(&self) -> Option<WorkerId> {
        *self.id.lock().expect("id lock")
    }

    /// Advertise this worker to the orchestrator.
    #[instrument(name = "WorkerService::join", skip(self))]
    pub async fn join(&self) -> Result<WorkerId> {
        let previous = self.id();
        let hello = Hello::builder()
            .worker_location(self.config.location.clone())
            .maybe_requested_id(previous)
            .build();

        let url = self.orchestrator_base.join("api/v1/hello")?;
        let response = self
            .client
            .post(url)
            .header(ContentType::HEADER, ContentType::MsgPack.value())
            .body(encode(&hello)?)
            .send()
            .await
            .context("send hello")?;
        let body = response.bytes().await.context("read hello response")?;

        match decode::<HelloResponse>(&body)? {
            HelloResponse::Accepted(id) => {
                *self.id.lock().expect("id lock") = Some(id);
                info!(worker = %id, "joined orchestrator");
                Ok(id)
            }
            HelloResponse::NoSlots => bail!("orchestrator has no worker slots"),
            HelloResponse::Released => {
                self.terminating.store(true, Ordering::SeqCst);
                bail!("orchestrator released this worker")
            }
        }
    }

    /// Receive the build-session context; reply with capacity facts.
    #[instrument(name = "WorkerService::handle_attach", skip(self, attach))]
    pub fn handle_attach(&self, attach: Attach) -> AttachCompleted {
        let id = self.id().unwrap_or(WorkerId(0));
        *self.session.lock().expect("session lock") = Some(attach);

        let limits = &self.engine_config.limits;
        let capacity = BTreeMap::from([
            (DispatcherKind::Cpu.to_string(), limits.max_cpu as u32),
            (DispatcherKind::Io.to_string(), limits.max_io as u32),
            (DispatcherKind::Light.to_string(), limits.max_light as u32),
            (DispatcherKind::IpcPips.to_string(), limits.max_ipc as u32),
        ]);

        let perf = perf_snapshot();
        AttachCompleted::builder()
            .worker_id(id)
            .capacity(capacity)
            .total_ram_mb(perf.machine_ram_mb + perf.engine_ram_mb)
            .available_ram_mb(perf.machine_ram_mb)
            .build()
    }

    /// Execute a dispatched batch; results stream back as pips finish.
    #[instrument(name = "WorkerService::handle_execute", skip(self, batch),
        fields(sequence = batch.sequence, pips = batch.requests.len()))]
    pub fn handle_execute(self: &Arc<Self>, batch: ExecutePips) {
        let this = self.clone();
        tokio::spawn(async move {
            let pip_ids = batch.requests.iter().map(|r| r.pip_id).collect::<Vec<_>>();
            if let Err(err) = this.run_batch(batch).await {
                warn!(?err, "pip batch failed wholesale");
                // The orchestrator is owed one result per dispatched pip
                // even when the batch never got off the ground.
                for pip_id in pip_ids {
                    let outcome = PipOutcome::Failed(PipFailure::internal(format!(
                        "batch failed: {err:#}"
                    )));
                    this.note_outcome(&outcome);
                    this.report_result(pip_id, &outcome, Duration::ZERO).await;
                }
            }
        });
    }

    async fn run_batch(self: &Arc<Self>, batch: ExecutePips) -> Result<()> {
        let session = self
            .session
            .lock()
            .expect("session lock")
            .clone()
            .ok_or_else(|| color_eyre::eyre::eyre!("execute before attach"))?;

        // Rebuild the dispatched pips against this machine's path table.
        let paths = Arc::new(PathTable::new());
        let mut builder = PipGraphBuilder::new(paths.clone());
        let mut wire_ids = Vec::new();
        for request in &batch.requests {
            let portable: PortablePip = decode(&request.payload).context("decode pip payload")?;
            let payload = intern_payload(&portable.payload, &paths)?;
            let local = builder.add_pip(
                payload,
                request.priority,
                request.weight,
                portable.tags.clone(),
            );
            wire_ids.push((local, request.pip_id));
        }
        let graph = Arc::new(builder.build()?);

        // The orchestrator's salt governs this session's fingerprints.
        let mut config = (*self.engine_config).clone();
        config.fingerprint_salt = FingerprintSalt::new(session.fingerprint_salt.clone());
        let config = Arc::new(config);

        let tracker = SharedOpaqueTracker::new(
            self.config.sideband_dir.clone(),
            format!("{}/{}", self.config.location, session.session_id),
            config.sandbox.mark_policy,
            config.sandbox.follow_symlinks_for_marks,
            config.sandbox.cas_keeps_hardlink,
        );
        let counters = Arc::new(BuildCounters::default());
        let executor = Arc::new(PipExecutor::new(
            graph.clone(),
            self.store.clone(),
            self.metadata.clone(),
            self.monitor.clone(),
            self.ipc.clone(),
            self.translator.clone(),
            config,
            session.session_id,
            tracker,
            counters.clone(),
            self.cancel.clone(),
        ));

        // Seed artifact facts from the manifest.
        for artifact in &batch.artifacts {
            executor.record_artifact_hash(artifact.path.clone(), artifact.hash);
        }

        // Drive the batch through its own dispatcher: batches are
        // independent, and per-batch queues keep one batch's slow pips from
        // starving another's scheduling.
        let dispatcher = Dispatcher::new(self.engine_config.limits.clone(), self.cancel.clone());
        let (completion_tx, mut completion_rx) =
            mpsc::unbounded_channel::<(PipId, PhaseResult, Instant)>();
        let mut outstanding = 0usize;
        for (local, _) in &wire_ids {
            let pip = graph.pip(*local)?;
            let kind = PipExecutor::<M, R, G, I>::initial_kind(pip);
            if dispatcher.enqueue(kind, *local, pip.priority, pip.weight) {
                outstanding += 1;
            } else {
                let _ = completion_tx.send((
                    *local,
                    PhaseResult::Done(PipOutcome::Failed(PipFailure::canceled())),
                    Instant::now(),
                ));
                outstanding += 1;
            }
        }

        let mut finished: Vec<(PipId, PipOutcome, Duration)> = Vec::new();
        while finished.len() < outstanding {
            for admission in dispatcher.poll_admissions() {
                let executor = executor.clone();
                let completion = completion_tx.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = executor.run_phase(admission.pip, admission.kind).await;
                    let pip = admission.pip;
                    drop(admission);
                    let _ = completion.send((pip, result, started));
                });
            }

            tokio::select! {
                completed = completion_rx.recv() => {
                    let Some((pip, result, started)) = completed else { break };
                    match result {
                        PhaseResult::Continue(kind) => {
                            let meta = graph.pip(pip)?;
                            if !dispatcher.enqueue(kind, pip, meta.priority, meta.weight) {
                                finished.push((
                                    pip,
                                    PipOutcome::Failed(PipFailure::canceled()),
                                    started.elapsed(),
                                ));
                            }
                        }
                        PhaseResult::Done(outcome) => {
                            finished.push((pip, outcome, started.elapsed()));
                        }
                    }
                }
                _ = dispatcher.changed() => {}
            }
        }

        // Collisions surfaced after a sibling in this batch already
        // finished: convert the reported success before results go back.
        let revocations = executor.revocations();
        while let Ok((pip, failure)) = revocations.try_recv() {
            if let Some(entry) = finished.iter_mut().find(|(p, _, _)| *p == pip) {
                if entry.1.is_success() {
                    entry.1 = PipOutcome::Failed(failure);
                }
            }
        }

        // Stream results back, one sequence-numbered report per pip.
        for (local, outcome, elapsed) in finished {
            let wire_id = wire_ids
                .iter()
                .find(|(l, _)| *l == local)
                .map(|(_, w)| *w)
                .unwrap_or(local.0);
            self.note_outcome(&outcome);
            self.report_result(wire_id, &outcome, elapsed).await;
        }
        Ok(())
    }

    fn note_outcome(&self, outcome: &PipOutcome) {
        let mut counts = self.counts.lock().expect("counts lock");
        match outcome {
            PipOutcome::Cached { .. } => counts.cache_hits += 1,
            PipOutcome::Executed { uncacheable, .. } => {
                counts.executed += 1;
                if *uncacheable {
                    counts.warnings += 1;
                }
            }
            PipOutcome::Failed(_) => counts.errors += 1,
        }
    }

    /// Report one pip result; retries keep the same sequence number so the
    /// orchestrator can deduplicate.
    #[instrument(name = "WorkerService::report_result", skip(self, outcome))]
    async fn report_result(&self, wire_id: u32, outcome: &PipOutcome, elapsed: Duration) {
        let Some(worker_id) = self.id() else { return };
        let sequence = self.result_sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let blob = match encode(outcome) {
            Ok(blob) => blob,
            Err(err) => {
                warn!(?err, "could not encode pip outcome");
                return;
            }
        };
        let report = ReportPipResults::builder()
            .worker_id(worker_id)
            .sequence(sequence)
            .results(vec![
                PipResult::builder()
                    .pip_id(wire_id)
                    .result_blob(blob)
                    .timings(PipTimings {
                        queued_ms: 0,
                        running_ms: elapsed.as_millis() as u64,
                        total_ms: elapsed.as_millis() as u64,
                    })
                    .build(),
            ])
            .build();

        let outcome = crate::error::retry_transient(
            5,
            Duration::from_millis(100),
            |_| true,
            || async {
                let url = self.orchestrator_base.join("api/v1/results")?;
                let response = self
                    .client
                    .post(url)
                    .header(ContentType::HEADER, ContentType::MsgPack.value())
                    .body(encode(&report)?)
                    .send()
                    .await
                    .context("send results")?;
                if !response.status().is_success() {
                    bail!("orchestrator returned {}", response.status());
                }
                Ok(())
            },
        )
        .await;

        if let Err(err) = outcome {
            warn!(?err, "result delivery failed past its retry budget");
        }
    }

    /// Handle an orderly exit request.
    #[instrument(name = "WorkerService::handle_exit", skip(self))]
    pub fn handle_exit(&self, exit: Exit) -> EventCounts {
        if let Some(failure) = &exit.failure {
            warn!(%failure, "orchestrator reported build failure at exit");
        }
        self.terminating.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        *self.counts.lock().expect("counts lock")
    }

    /// Spawn the heartbeat loop. Consecutive delivery failures mean the
    /// orchestrator is gone; the worker moves to Terminating.
    pub fn spawn_heartbeats(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.heartbeat_interval);
            loop {
                ticker.tick().await;
                if this.is_terminating() {
                    break;
                }
                let Some(worker_id) = this.id() else { continue };

                let heartbeat = Heartbeat::builder()
                    .worker_id(worker_id)
                    .perf(perf_snapshot())
                    .build();
                let delivered = async {
                    let url = this.orchestrator_base.join("api/v1/heartbeat")?;
                    let response = this
                        .client
                        .post(url)
                        .header(ContentType::HEADER, ContentType::MsgPack.value())
                        .body(encode(&heartbeat)?)
                        .send()
                        .await
                        .context("send heartbeat")?;
                    if !response.status().is_success() {
                        bail!("orchestrator returned {}", response.status());
                    }
                    Ok::<_, color_eyre::Report>(())
                }
                .await;

                match delivered {
                    Ok(()) => {
                        this.heartbeat_failures.store(0, Ordering::SeqCst);
                    }
                    Err(err) => {
                        let failures =
                            this.heartbeat_failures.fetch_add(1, Ordering::SeqCst) + 1;
                        debug!(?err, failures, "heartbeat delivery failed");
                        if failures >= ORCHESTRATOR_LOST_AFTER {
                            warn!("orchestrator lost; worker terminating");
                            this.terminating.store(true, Ordering::SeqCst);
                            this.cancel.cancel();
                            break;
                        }
                    }
                }
            }
        })
    }
}
