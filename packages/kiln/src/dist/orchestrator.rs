//! The orchestrator role.
//!
//! Accepts worker attachments, dispatches pips in sequence-numbered
//! batches, reassembles result and execution-log streams per worker, and
//! watches heartbeats. A worker that misses its heartbeat window is marked
//! dead and its in-flight pips are re-dispatched at boosted priority to the
//! surviving workers.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use wire::{
    ContentHash, ContentType,
    dist::v1::{
        ArtifactManifestEntry, Attach, AttachCompleted, EventCounts, ExecutePips, Exit,
        Heartbeat, Hello, HelloResponse, MachineLocation, PerfSnapshot, ReportExecutionLog,
        ReportPipResults, SinglePipBuildRequest, WorkerId, decode, encode,
    },
};

use crate::{
    engine::RemotePool,
    error::{FailureCode, PipFailure},
    exec::PipOutcome,
    graph::PipGraph,
    pip::PipId,
};

use super::{SequenceGate, render_pip};

/// Looks up known artifact hashes by rendered path, for building dispatch
/// manifests. Wired to the local executor's artifact table.
pub type ArtifactIndex = Arc<dyn Fn(&str) -> Option<(ContentHash, u64)> + Send + Sync>;

/// Priority boost applied when a dead worker's pips are re-dispatched.
const RETRY_PRIORITY_BOOST: u32 = 100;

/// Orchestrator settings.
#[derive(Clone, Debug, Builder)]
pub struct OrchestratorConfig {
    pub session_id: Uuid,
    pub fingerprint_salt: String,
    pub cache_graph: ContentHash,
    #[builder(default = 8)]
    pub max_workers: usize,
    #[builder(default = Duration::from_secs(30))]
    pub heartbeat_timeout: Duration,
    #[builder(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// A pip handed to a worker, kept so it can be re-dispatched if the worker
/// dies.
struct PendingPip {
    request: SinglePipBuildRequest,
    artifacts: Vec<ArtifactManifestEntry>,
    sender: oneshot::Sender<PipOutcome>,
}

/// One attached worker.
pub struct WorkerEntry {
    pub id: WorkerId,
    pub location: MachineLocation,
    base: Url,
    client: reqwest::Client,
    /// Total concurrent pips the worker advertised.
    capacity: AtomicU32,
    attached: AtomicBool,
    dead: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    last_perf: Mutex<PerfSnapshot>,
    assigned: DashMap<u32, PendingPip>,
    next_sequence: AtomicU64,
}

impl WorkerEntry {
    fn is_available(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
            && !self.dead.load(Ordering::SeqCst)
            && (self.assigned.len() as u32) < self.capacity.load(Ordering::SeqCst)
    }

    /// The last performance facts the worker reported.
    pub fn perf(&self) -> PerfSnapshot {
        *self.last_perf.lock().expect("perf lock")
    }
}

/// The orchestrator service state.
pub struct Orchestrator {
    config: OrchestratorConfig,
    workers: DashMap<WorkerId, Arc<WorkerEntry>>,
    released: DashMap<WorkerId, ()>,
    next_id: AtomicU32,
    results_gate: SequenceGate,
    log_gate: SequenceGate,
    logs: DashMap<WorkerId, BTreeMap<u64, Vec<u8>>>,
    artifacts: ArtifactIndex,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, artifacts: ArtifactIndex) -> Arc<Self> {
        Arc::new(Self {
            config,
            workers: DashMap::new(),
            released: DashMap::new(),
            next_id: AtomicU32::new(1),
            results_gate: SequenceGate::new(),
            log_gate: SequenceGate::new(),
            logs: DashMap::new(),
            artifacts,
        })
    }

    /// Handle a worker's hello.
    #[instrument(name = "Orchestrator::hello", skip(self))]
    pub fn hello(&self, hello: Hello) -> Result<HelloResponse> {
        if let Some(requested) = hello.requested_id {
            if self.released.contains_key(&requested) {
                return Ok(HelloResponse::Released);
            }
            if let Some(existing) = self.workers.get(&requested) {
                if existing.location == hello.worker_location {
                    // A rejoin after a transient disconnect.
                    existing.dead.store(false, Ordering::SeqCst);
                    return Ok(HelloResponse::Accepted(requested));
                }
            }
        }

        if self.workers.len() >= self.config.max_workers {
            return Ok(HelloResponse::NoSlots);
        }

        let id = WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let base = Url::parse(hello.worker_location.as_str())
            .with_context(|| format!("parse worker location {}", hello.worker_location))?;
        let entry = Arc::new(WorkerEntry {
            id,
            location: hello.worker_location,
            base,
            client: reqwest::Client::new(),
            capacity: AtomicU32::new(0),
            attached: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Instant::now()),
            last_perf: Mutex::new(PerfSnapshot::default()),
            assigned: DashMap::new(),
            next_sequence: AtomicU64::new(0),
        });
        self.workers.insert(id, entry);
        info!(worker = %id, "worker accepted");
        Ok(HelloResponse::Accepted(id))
    }

    /// The attach payload sent to a newly accepted worker.
    pub fn attach_payload(&self) -> Attach {
        Attach::builder()
            .session_id(self.config.session_id)
            .cache_graph(self.config.cache_graph)
            .fingerprint_salt(self.config.fingerprint_salt.clone())
            .env_vars(self.config.env_vars.clone())
            .build()
    }

    /// Handle a worker's attach completion: the worker becomes schedulable.
    #[instrument(name = "Orchestrator::attach_completed", skip(self))]
    pub fn attach_completed(&self, message: AttachCompleted) {
        if let Some(entry) = self.workers.get(&message.worker_id) {
            let total: u32 = message.capacity.values().sum();
            entry.capacity.store(total.max(1), Ordering::SeqCst);
            entry.attached.store(true, Ordering::SeqCst);
            *entry.last_heartbeat.lock().expect("heartbeat lock") = Instant::now();
            info!(worker = %message.worker_id, capacity = total, "worker attached");
        }
    }

    /// Ingest a result batch. Duplicate sequences are dropped, which makes
    /// worker retries idempotent.
    #[instrument(name = "Orchestrator::report_results", skip(self, report))]
    pub fn report_results(&self, report: ReportPipResults) {
        if !self.results_gate.accept(report.worker_id, report.sequence) {
            return;
        }
        let Some(entry) = self.workers.get(&report.worker_id) else {
            return;
        };

        for result in report.results {
            let Some((_, pending)) = entry.assigned.remove(&result.pip_id) else {
                continue;
            };
            let outcome = match decode::<PipOutcome>(&result.result_blob) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(?err, pip = result.pip_id, "undecodable pip result");
                    PipOutcome::Failed(PipFailure::infrastructure(
                        FailureCode::WorkerLost,
                        "worker returned an undecodable result",
                    ))
                }
            };
            for event in &result.forwarded_events {
                debug!(worker = %report.worker_id, level = %event.level, "{}", event.message);
            }
            let _ = pending.sender.send(outcome);
        }
    }

    /// Ingest an execution-log blob.
    pub fn report_execution_log(&self, report: ReportExecutionLog) {
        if !self.log_gate.accept(report.worker_id, report.sequence) {
            return;
        }
        self.logs
            .entry(report.worker_id)
            .or_default()
            .insert(report.sequence, report.blob);
    }

    /// The worker's execution log, reassembled in sequence order.
    pub fn assembled_execution_log(&self, worker: WorkerId) -> Vec<u8> {
        self.logs
            .get(&worker)
            .map(|blobs| blobs.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Handle a heartbeat.
    pub fn heartbeat(&self, heartbeat: Heartbeat) {
        if let Some(entry) = self.workers.get(&heartbeat.worker_id) {
            *entry.last_heartbeat.lock().expect("heartbeat lock") = Instant::now();
            *entry.last_perf.lock().expect("perf lock") = heartbeat.perf;
        }
    }

    /// Mark workers whose heartbeats lapsed as dead and re-dispatch their
    /// in-flight pips elsewhere. Returns the workers newly marked dead.
    #[instrument(name = "Orchestrator::check_workers", skip(self))]
    pub fn check_workers(self: &Arc<Self>) -> Vec<WorkerId> {
        let mut newly_dead = Vec::new();
        for entry in self.workers.iter() {
            let worker = entry.value();
            if worker.dead.load(Ordering::SeqCst) || !worker.attached.load(Ordering::SeqCst) {
                continue;
            }
            let age = worker.last_heartbeat.lock().expect("heartbeat lock").elapsed();
            if age > self.config.heartbeat_timeout {
                worker.dead.store(true, Ordering::SeqCst);
                newly_dead.push(worker.id);
            }
        }

        for dead in &newly_dead {
            warn!(worker = %dead, "worker heartbeat lapsed; re-dispatching its pips");
            self.reassign_from(*dead);
        }
        newly_dead
    }

    /// Spawn the heartbeat monitor.
    pub fn spawn_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = this.config.heartbeat_timeout / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            loop {
                ticker.tick().await;
                this.check_workers();
            }
        })
    }

    fn reassign_from(self: &Arc<Self>, dead: WorkerId) {
        let Some(entry) = self.workers.get(&dead) else {
            return;
        };
        let pips = entry
            .assigned
            .iter()
            .map(|p| *p.key())
            .collect::<Vec<_>>();
        drop(entry);

        for pip in pips {
            let Some(entry) = self.workers.get(&dead) else { break };
            let Some((_, mut pending)) = entry.assigned.remove(&pip) else {
                continue;
            };
            drop(entry);

            pending.request.priority = pending.request.priority.saturating_add(RETRY_PRIORITY_BOOST);
            if let Some(target) = self.pick_worker() {
                debug!(pip, from = %dead, to = %target.id, "re-dispatching pip");
                self.dispatch_to(target, pending);
            } else {
                let _ = pending.sender.send(PipOutcome::Failed(PipFailure::infrastructure(
                    FailureCode::WorkerLost,
                    "worker lost and no other worker available",
                )));
            }
        }
    }

    /// How many workers are attached, alive, and have spare capacity.
    pub fn available_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_available()).count()
    }

    fn pick_worker(&self) -> Option<Arc<WorkerEntry>> {
        self.workers
            .iter()
            .filter(|w| w.is_available())
            .min_by_key(|w| w.assigned.len())
            .map(|w| w.value().clone())
    }

    fn dispatch_to(self: &Arc<Self>, worker: Arc<WorkerEntry>, pending: PendingPip) {
        let sequence = worker.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let batch = ExecutePips::builder()
            .sequence(sequence)
            .requests(vec![pending.request.clone()])
            .artifacts(pending.artifacts.clone())
            .build();
        let pip_id = pending.request.pip_id;
        worker.assigned.insert(pip_id, pending);

        let this = self.clone();
        let worker_id = worker.id;
        tokio::spawn(async move {
            let outcome = crate::error::retry_transient(
                3,
                Duration::from_millis(200),
                |_| true,
                || async {
                    let url = worker.base.join("api/v1/pips").context("join url")?;
                    let body = encode(&batch)?;
                    let response = worker
                        .client
                        .post(url)
                        .header(ContentType::HEADER, ContentType::MsgPack.value())
                        .body(body)
                        .send()
                        .await
                        .context("send pip batch")?;
                    if !response.status().is_success() {
                        color_eyre::eyre::bail!("worker returned {}", response.status());
                    }
                    Ok(())
                },
            )
            .await;

            if let Err(err) = outcome {
                warn!(worker = %worker_id, ?err, "pip dispatch failed; worker marked dead");
                worker.dead.store(true, Ordering::SeqCst);
                this.reassign_from(worker_id);
            }
        });
    }

    /// Send an orderly exit to every worker and collect their final event
    /// counts.
    #[instrument(name = "Orchestrator::exit_all", skip(self))]
    pub async fn exit_all(&self, failure: Option<String>) -> Vec<(WorkerId, EventCounts)> {
        let mut counts = Vec::new();
        for entry in self.workers.iter() {
            let worker = entry.value().clone();
            self.released.insert(worker.id, ());
            let exit = Exit::builder().maybe_failure(failure.clone()).build();

            let result = async {
                let url = worker.base.join("api/v1/exit").context("join url")?;
                let response = worker
                    .client
                    .post(url)
                    .header(ContentType::HEADER, ContentType::MsgPack.value())
                    .body(encode(&exit)?)
                    .send()
                    .await
                    .context("send exit")?;
                let body = response.bytes().await.context("read exit response")?;
                decode::<EventCounts>(&body)
            }
            .await;

            match result {
                Ok(count) => counts.push((worker.id, count)),
                Err(err) => warn!(worker = %worker.id, ?err, "worker exit failed"),
            }
        }
        counts
    }

    /// Build the manifest of artifact facts a pip's inputs need.
    fn manifest_for(&self, graph: &PipGraph, pip: PipId) -> Vec<ArtifactManifestEntry> {
        let Ok(pip) = graph.pip(pip) else {
            return Vec::new();
        };
        pip.declared_file_inputs()
            .into_iter()
            .filter_map(|artifact| {
                let rendered = graph.paths().resolve_lossy(artifact.path);
                let (hash, length) = (self.artifacts)(&rendered)?;
                Some(
                    ArtifactManifestEntry::builder()
                        .path(rendered)
                        .rewrite_count(artifact.rewrite_count)
                        .hash(hash)
                        .length(length)
                        .build(),
                )
            })
            .collect()
    }
}

impl RemotePool for Arc<Orchestrator> {
    fn try_assign(
        &self,
        graph: &PipGraph,
        pip: PipId,
    ) -> Option<oneshot::Receiver<PipOutcome>> {
        let worker = self.pick_worker()?;
        let pip_meta = graph.pip(pip).ok()?;

        let payload = match encode(&render_pip(graph, pip_meta)) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(?err, "could not render pip for dispatch");
                return None;
            }
        };
        let request = SinglePipBuildRequest::builder()
            .pip_id(pip.0)
            .semi_stable_hash(pip_meta.semi_stable_hash.0)
            .priority(pip_meta.priority)
            .weight(pip_meta.weight)
            .payload(payload)
            .build();

        let (sender, receiver) = oneshot::channel();
        let pending = PendingPip {
            artifacts: self.manifest_for(graph, pip),
            request,
            sender,
        };
        self.dispatch_to(worker, pending);
        Some(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn orchestrator() -> Arc<Orchestrator> {
        let config = OrchestratorConfig::builder()
            .session_id(Uuid::nil())
            .fingerprint_salt("salt".into())
            .cache_graph(ContentHash::from_buffer(b"graph"))
            .max_workers(2)
            .heartbeat_timeout(Duration::from_millis(50))
            .build();
        Orchestrator::new(config, Arc::new(|_| None))
    }

    fn hello(location: &str) -> Hello {
        Hello::builder()
            .worker_location(MachineLocation::new(location))
            .build()
    }

    #[tokio::test]
    async fn hello_assigns_ids_and_respects_slots() {
        let orchestrator = orchestrator();

        let first = orchestrator.hello(hello("http://w1")).unwrap();
        let second = orchestrator.hello(hello("http://w2")).unwrap();
        let third = orchestrator.hello(hello("http://w3")).unwrap();

        assert!(matches!(first, HelloResponse::Accepted(WorkerId(1))));
        assert!(matches!(second, HelloResponse::Accepted(WorkerId(2))));
        assert!(matches!(third, HelloResponse::NoSlots));
    }

    #[tokio::test]
    async fn rejoin_keeps_the_id() {
        let orchestrator = orchestrator();
        let HelloResponse::Accepted(id) = orchestrator.hello(hello("http://w1")).unwrap()
        else {
            panic!("expected accept");
        };

        let rejoin = Hello::builder()
            .worker_location(MachineLocation::new("http://w1"))
            .requested_id(id)
            .build();
        let response = orchestrator.hello(rejoin).unwrap();
        assert!(matches!(response, HelloResponse::Accepted(got) if got == id));
    }

    #[tokio::test]
    async fn heartbeat_lapse_marks_dead() {
        let orchestrator = orchestrator();
        let HelloResponse::Accepted(id) = orchestrator.hello(hello("http://w1")).unwrap()
        else {
            panic!("expected accept");
        };
        orchestrator.attach_completed(
            AttachCompleted::builder()
                .worker_id(id)
                .capacity(BTreeMap::from([("Cpu".to_string(), 4)]))
                .total_ram_mb(1024)
                .available_ram_mb(512)
                .build(),
        );

        pretty_assert_eq!(orchestrator.check_workers(), Vec::<WorkerId>::new());
        tokio::time::sleep(Duration::from_millis(80)).await;
        pretty_assert_eq!(orchestrator.check_workers(), vec![id]);
        // Already dead: not reported twice.
        pretty_assert_eq!(orchestrator.check_workers(), Vec::<WorkerId>::new());
    }

    #[tokio::test]
    async fn execution_log_reassembles_in_order() {
        let orchestrator = orchestrator();
        let worker = WorkerId(9);

        for (seq, blob) in [(2u64, b"world".to_vec()), (1, b"hello ".to_vec())] {
            orchestrator.report_execution_log(
                ReportExecutionLog::builder()
                    .worker_id(worker)
                    .sequence(seq)
                    .blob(blob)
                    .build(),
            );
        }
        // A duplicate of sequence 2 is dropped.
        orchestrator.report_execution_log(
            ReportExecutionLog::builder()
                .worker_id(worker)
                .sequence(2)
                .blob(b"DUPLICATE".to_vec())
                .build(),
        );

        pretty_assert_eq!(
            orchestrator.assembled_execution_log(worker),
            b"hello world".to_vec()
        );
    }
}
