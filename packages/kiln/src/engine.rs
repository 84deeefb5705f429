//! The build driver.
//!
//! Owns the loop that feeds the dispatcher: seed the ready pips, spawn a
//! task per admission, apply each phase result, propagate completion to
//! dependents and failure taint to their subtrees, and fold everything into
//! a [`BuildSummary`] with a single [`ExitKind`] at the end.
//!
//! The driver never blocks inside the loop: phases run on spawned tasks and
//! report back over a channel, so a slow pip can never stall scheduling.

use std::{collections::BTreeMap, sync::Arc};

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    cas::{directory::GlobalDirectory, remote::RemoteStore},
    config::EngineConfig,
    dispatch::{Dispatcher, DispatcherKind},
    error::{CriticalErrorChannel, ExitKind, FailureCode, FailureKind, MissReason, PipFailure},
    exec::{BuildCounters, IpcRelay, PhaseResult, PipExecutor, PipOutcome},
    graph::PipGraph,
    pip::{PipId, PipPayload, PipState, SealKind},
    sandbox::Monitor,
};

/// A sink that may take pips for remote execution.
///
/// The orchestrator side of the distribution protocol implements this; a
/// local-only build runs with `None`. `try_assign` returns `None` when no
/// worker has capacity, in which case the pip runs locally.
pub trait RemotePool: Send + Sync {
    fn try_assign(
        &self,
        graph: &PipGraph,
        pip: PipId,
    ) -> Option<oneshot::Receiver<PipOutcome>>;
}

/// The structured result of one build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildSummary {
    pub exit_kind: ExitKind,
    pub session_id: Uuid,
    pub total_pips: usize,
    pub cache_hits: u64,
    pub executed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub canceled: u64,
    pub weak_fingerprint_misses: u64,
    pub strong_fingerprint_misses: u64,
    pub miss_reasons: BTreeMap<MissReason, u64>,
    /// Counts of pip failures by stable failure code.
    pub failure_codes: BTreeMap<String, u64>,
}

impl BuildSummary {
    pub fn succeeded(&self) -> u64 {
        self.cache_hits + self.executed
    }

    pub fn was_hit(&self, total_cacheable: u64) -> bool {
        self.cache_hits == total_cacheable
    }
}

/// One build session over a frozen graph.
pub struct Build<M, R, G, I> {
    graph: Arc<PipGraph>,
    executor: Arc<PipExecutor<M, R, G, I>>,
    dispatcher: Arc<Dispatcher>,
    counters: Arc<BuildCounters>,
    config: Arc<EngineConfig>,
    critical: CriticalErrorChannel,
    remote: Option<Arc<dyn RemotePool>>,
    cancel: CancellationToken,
    session_id: Uuid,
}

impl<M, R, G, I> Build<M, R, G, I>
where
    M: Monitor,
    R: RemoteStore,
    G: GlobalDirectory,
    I: IpcRelay,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<PipGraph>,
        executor: Arc<PipExecutor<M, R, G, I>>,
        dispatcher: Arc<Dispatcher>,
        counters: Arc<BuildCounters>,
        config: Arc<EngineConfig>,
        critical: CriticalErrorChannel,
        remote: Option<Arc<dyn RemotePool>>,
        cancel: CancellationToken,
        session_id: Uuid,
    ) -> Self {
        Self {
            graph,
            executor,
            dispatcher,
            counters,
            config,
            critical,
            remote,
            cancel,
            session_id,
        }
    }

    /// Run the build to completion (or cancellation).
    #[instrument(name = "Build::run", skip(self), fields(session = %self.session_id))]
    pub async fn run(self) -> Result<BuildSummary> {
        let total = self.graph.len();
        let mut states: Vec<PipState> = vec![PipState::Ready; total];
        let mut failures: Vec<Option<PipFailure>> = vec![None; total];
        let mut remaining: Vec<usize> = (0..total)
            .map(|i| self.graph.dependency_count(PipId(i as u32)))
            .collect();

        self.scrub_shared_opaques().await?;

        // Declared double writes fail both producers before anything runs,
        // so neither side can reach Executed.
        for (artifact, producers) in self.graph.declared_double_writes() {
            let rendered = self.graph.paths().resolve_lossy(artifact.path);
            for pip in producers {
                if states[pip.0 as usize].is_terminal() {
                    continue;
                }
                states[pip.0 as usize] = PipState::Failed;
                failures[pip.0 as usize] = Some(PipFailure::user(
                    FailureCode::InvalidOutputDueToSimpleDoubleWrite,
                    format!("output {rendered} is declared by multiple pips"),
                ));
            }
        }
        let pre_failed = (0..total)
            .map(|i| PipId(i as u32))
            .filter(|p| states[p.0 as usize] == PipState::Failed)
            .collect::<Vec<_>>();
        for pip in pre_failed {
            self.taint_dependents(pip, &mut states);
        }

        // Seed everything ready.
        for pip in self.graph.pips() {
            let index = pip.id.0 as usize;
            if states[index] == PipState::Ready && remaining[index] == 0 {
                self.enqueue(pip.id, &mut states);
            }
        }

        let (completion_tx, mut completion_rx) =
            mpsc::unbounded_channel::<(PipId, PhaseResult)>();
        let mut critical_rx = self.critical.subscribe();
        let revocations = self.executor.revocations();

        loop {
            if states.iter().all(PipState::is_terminal) {
                break;
            }
            if self.cancel.is_cancelled() {
                self.finish_cancelation(&mut states, &mut completion_rx, &mut failures)
                    .await;
                break;
            }

            for admission in self.dispatcher.poll_admissions() {
                let pip = admission.pip;
                let kind = admission.kind;
                if states[pip.0 as usize].is_terminal() {
                    // Tainted (or canceled) while queued; dropping the
                    // admission releases the slot.
                    continue;
                }
                states[pip.0 as usize] = PipState::Running(kind);
                self.spawn_phase(pip, kind, admission, completion_tx.clone());
            }

            tokio::select! {
                completed = completion_rx.recv() => {
                    let Some((pip, result)) = completed else { break };
                    self.apply(pip, result, &mut states, &mut remaining, &mut failures);
                }
                revoked = revocations.recv_async() => {
                    if let Ok((pip, failure)) = revoked {
                        self.apply_revocation(pip, failure, &mut states, &mut failures);
                    }
                }
                _ = self.dispatcher.changed() => {}
                critical = critical_rx.recv() => {
                    if let Ok(message) = critical {
                        warn!(%message, "critical error; canceling build");
                        failures.push(Some(PipFailure::internal(message)));
                        self.cancel.cancel();
                    }
                }
            }
        }

        // Revocations raised in the build's final moments may still be
        // queued after every pip went terminal.
        while let Ok((pip, failure)) = revocations.try_recv() {
            self.apply_revocation(pip, failure, &mut states, &mut failures);
        }

        Ok(self.summarize(&states, &failures))
    }

    /// Retroactively fail a pip the executor revoked (a later sibling
    /// claimed one of its output paths).
    fn apply_revocation(
        &self,
        pip: PipId,
        failure: PipFailure,
        states: &mut [PipState],
        failures: &mut [Option<PipFailure>],
    ) {
        let index = pip.0 as usize;
        match states[index] {
            // Its success must not stand, and its dependents consumed a
            // contested output.
            PipState::Cached | PipState::Executed => {
                warn!(%pip, "retroactively failing finished pip");
                failures[index] = Some(failure);
                states[index] = PipState::Failed;
                self.taint_dependents(pip, states);
            }
            // Already terminal on its own terms; its recorded failure (if
            // any) stands.
            PipState::Failed | PipState::Skipped | PipState::Canceled => {}
            // Still in flight: the executor converts the outcome at the
            // phase boundary, and `apply` double-checks against the
            // recorded failure.
            PipState::Ready | PipState::Queued(_) | PipState::Running(_) => {
                failures[index] = Some(failure);
            }
        }
    }

    fn spawn_phase(
        &self,
        pip: PipId,
        kind: DispatcherKind,
        admission: crate::dispatch::Admission,
        completion: mpsc::UnboundedSender<(PipId, PhaseResult)>,
    ) {
        // Worker choice happens here, where the pool lives: a pip a remote
        // worker accepts is awaited instead of executed locally.
        if matches!(
            kind,
            DispatcherKind::ChooseWorkerCpu
                | DispatcherKind::ChooseWorkerLight
                | DispatcherKind::ChooseWorkerIpc
        ) {
            if let Some(pool) = &self.remote {
                if let Some(receiver) = pool.try_assign(&self.graph, pip) {
                    debug!(%pip, "assigned to remote worker");
                    tokio::spawn(async move {
                        let result = match receiver.await {
                            Ok(outcome) => PhaseResult::Done(outcome),
                            Err(_) => PhaseResult::Done(PipOutcome::Failed(
                                PipFailure::infrastructure(
                                    FailureCode::WorkerLost,
                                    "worker dropped the pip without a result",
                                ),
                            )),
                        };
                        drop(admission);
                        let _ = completion.send((pip, result));
                    });
                    return;
                }
            }
        }

        let executor = self.executor.clone();
        tokio::spawn(async move {
            let result = executor.run_phase(pip, kind).await;
            drop(admission);
            let _ = completion.send((pip, result));
        });
    }

    fn apply(
        &self,
        pip: PipId,
        result: PhaseResult,
        states: &mut [PipState],
        remaining: &mut [usize],
        failures: &mut [Option<PipFailure>],
    ) {
        match result {
            PhaseResult::Continue(kind) => {
                let index = pip.0 as usize;
                let pip_meta = self.graph.pip(pip).expect("pip in graph");
                states[index] = PipState::Queued(kind);
                if !self
                    .dispatcher
                    .enqueue(kind, pip, pip_meta.priority, pip_meta.weight)
                {
                    states[index] = PipState::Canceled;
                }
            }
            PhaseResult::Done(outcome) => {
                let index = pip.0 as usize;
                // A revocation that raced ahead of this completion left its
                // failure on record; the late-arriving success loses.
                let outcome = match failures[index].clone() {
                    Some(failure) if outcome.is_success() => PipOutcome::Failed(failure),
                    _ => outcome,
                };
                // Remotely-executed pips bypass the local executor, so
                // their output hashes are seeded here for dependents.
                for output in outcome.outputs() {
                    self.executor
                        .record_artifact_hash(output.path.clone(), output.hash);
                }
                match &outcome {
                    PipOutcome::Cached { .. } => states[index] = PipState::Cached,
                    PipOutcome::Executed { .. } => states[index] = PipState::Executed,
                    PipOutcome::Failed(failure) => {
                        states[index] = if failure.kind == FailureKind::Canceled {
                            PipState::Canceled
                        } else {
                            PipState::Failed
                        };
                        failures[index] = Some(failure.clone());
                    }
                }

                if outcome.is_success() {
                    for dependent in self.graph.dependents(pip) {
                        let dep_index = dependent.0 as usize;
                        remaining[dep_index] = remaining[dep_index].saturating_sub(1);
                        if remaining[dep_index] == 0 && states[dep_index] == PipState::Ready {
                            self.enqueue(dependent, states);
                        }
                    }
                } else {
                    self.taint_dependents(pip, states);
                }
            }
        }
    }

    fn enqueue(&self, pip: PipId, states: &mut [PipState]) {
        let pip_meta = self.graph.pip(pip).expect("pip in graph");
        let kind = PipExecutor::<M, R, G, I>::initial_kind(pip_meta);
        states[pip.0 as usize] = PipState::Queued(kind);
        if !self
            .dispatcher
            .enqueue(kind, pip, pip_meta.priority, pip_meta.weight)
        {
            states[pip.0 as usize] = PipState::Canceled;
        }
    }

    /// Mark every transitive dependent of a failed pip as skipped.
    fn taint_dependents(&self, failed: PipId, states: &mut [PipState]) {
        let mut stack = self.graph.dependents(failed).collect::<Vec<_>>();
        while let Some(dependent) = stack.pop() {
            let index = dependent.0 as usize;
            if states[index].is_terminal() {
                continue;
            }
            states[index] = PipState::Skipped;
            stack.extend(self.graph.dependents(dependent));
        }
    }

    async fn finish_cancelation(
        &self,
        states: &mut [PipState],
        completion_rx: &mut mpsc::UnboundedReceiver<(PipId, PhaseResult)>,
        failures: &mut [Option<PipFailure>],
    ) {
        let drained = self.dispatcher.drain(self.config.cancel_timeout).await;
        if !drained {
            warn!("cancel drain window expired with work outstanding");
        }
        // Collect whatever results landed during the drain; everything else
        // is canceled.
        while let Ok((pip, result)) = completion_rx.try_recv() {
            let remaining_len = states.len();
            let mut remaining = vec![0usize; remaining_len];
            self.apply(pip, result, states, &mut remaining, failures);
        }
        for state in states.iter_mut() {
            if !state.is_terminal() {
                *state = PipState::Canceled;
            }
        }
    }

    fn summarize(&self, states: &[PipState], failures: &[Option<PipFailure>]) -> BuildSummary {
        use std::sync::atomic::Ordering;

        // Counted from terminal states, not the executor's counters, so
        // remotely-executed pips land in the same tallies.
        let mut cache_hits = 0;
        let mut executed = 0;
        let mut skipped = 0;
        let mut failed = 0;
        let mut canceled = 0;
        for state in states {
            match state {
                PipState::Cached => cache_hits += 1,
                PipState::Executed => executed += 1,
                PipState::Skipped => skipped += 1,
                PipState::Failed => failed += 1,
                PipState::Canceled => canceled += 1,
                _ => {}
            }
        }

        let worst = failures.iter().flatten().map(|f| f.kind).fold(
            None::<FailureKind>,
            |worst, kind| match (worst, kind) {
                (_, FailureKind::Internal) | (Some(FailureKind::Internal), _) => {
                    Some(FailureKind::Internal)
                }
                (_, FailureKind::User) | (Some(FailureKind::User), _) => Some(FailureKind::User),
                (_, FailureKind::Infrastructure) | (Some(FailureKind::Infrastructure), _) => {
                    Some(FailureKind::Infrastructure)
                }
                (worst, kind) => worst.or(Some(kind)),
            },
        );

        let exit_kind = if canceled > 0 && worst.is_none() {
            ExitKind::Canceled
        } else {
            worst.map(|k| k.exit_kind()).unwrap_or(ExitKind::Success)
        };

        let mut failure_codes = BTreeMap::new();
        for failure in failures.iter().flatten() {
            *failure_codes.entry(failure.code.to_string()).or_insert(0) += 1;
        }

        let summary = BuildSummary {
            exit_kind,
            session_id: self.session_id,
            total_pips: states.len(),
            failure_codes,
            cache_hits,
            executed,
            skipped,
            failed,
            canceled,
            weak_fingerprint_misses: self
                .counters
                .weak_fingerprint_misses
                .load(Ordering::Relaxed),
            strong_fingerprint_misses: self
                .counters
                .strong_fingerprint_misses
                .load(Ordering::Relaxed),
            miss_reasons: self.counters.miss_reasons(),
        };
        info!(
            exit = %summary.exit_kind,
            hits = summary.cache_hits,
            executed = summary.executed,
            failed = summary.failed,
            "build finished"
        );
        summary
    }

    /// Scrub stale shared-opaque outputs before anything runs.
    async fn scrub_shared_opaques(&self) -> Result<()> {
        let mut roots = Vec::new();
        for pip in self.graph.pips() {
            if let PipPayload::Process(process) = &pip.payload {
                for dir in &process.output_dirs {
                    if dir.kind == SealKind::SharedOpaque {
                        let root = self.graph.paths().resolve(dir.path).as_ref().clone();
                        if !roots.contains(&root) {
                            roots.push(root);
                        }
                    }
                }
            }
        }
        if roots.is_empty() {
            return Ok(());
        }

        let summary = self.executor.tracker().scrub(&roots).await?;
        debug!(
            scrubbed = summary.scrubbed.len(),
            examined = summary.examined,
            "shared-opaque scrub before build"
        );
        Ok(())
    }
}
