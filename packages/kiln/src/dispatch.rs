//! The pip dispatcher: named priority queues with independent parallelism.
//!
//! Every runnable pip carries a current [`DispatcherKind`]; when a pip
//! finishes one phase, the executor returns it to the dispatcher under the
//! kind of its next phase. The dispatcher is a cooperative loop: whenever
//! state changes it offers the highest-priority ready pip from each queue
//! until that queue's concurrency budget is exhausted or it has no
//! candidate. None of its methods block while holding a queue lock.
//!
//! CPU admission is weight-based: acquiring a CPU slot atomically acquires
//! `weight` permits from a shared semaphore, where a pip's weight reflects
//! its expected-peak working set. With historical throttling enabled the
//! CPU queue has no count cap at all and the semaphore is the only
//! throttle.

use std::{
    collections::{BinaryHeap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumIter, EnumString, IntoEnumIterator};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::pip::PipId;

/// The named queues of the dispatcher.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, StrumDisplay, EnumString, EnumIter,
    Serialize, Deserialize,
)]
pub enum DispatcherKind {
    Io,
    CacheLookup,
    DelayedCacheLookup,
    ChooseWorkerCacheLookup,
    ChooseWorkerCpu,
    ChooseWorkerLight,
    ChooseWorkerIpc,
    Cpu,
    Materialize,
    Light,
    IpcPips,
}

/// Per-queue parallelism limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchLimits {
    pub max_io: usize,
    pub max_cache_lookup: usize,
    pub max_choose_worker: usize,
    pub max_cpu: usize,
    pub max_materialize: usize,
    pub max_light: usize,
    pub max_ipc: usize,
    /// Total permits in the CPU weight semaphore.
    pub cpu_weight_permits: usize,
    /// When set, the CPU queue is unbounded by count and throttled solely
    /// by the weight semaphore.
    pub use_historical_cpu_throttling: bool,
    /// When set, a CPU candidate whose weight cannot be admitted right now
    /// is deprioritized instead of stalling the queue head.
    pub deprioritize_on_semaphore_block: bool,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        let processes = num_cpus::get().max(1);
        Self {
            max_io: 4,
            max_cache_lookup: processes * 2,
            max_choose_worker: processes,
            max_cpu: processes,
            max_materialize: processes,
            max_light: processes * 4,
            max_ipc: processes,
            cpu_weight_permits: processes * 4,
            use_historical_cpu_throttling: false,
            deprioritize_on_semaphore_block: true,
        }
    }
}

impl DispatchLimits {
    fn cap(&self, kind: DispatcherKind) -> usize {
        match kind {
            DispatcherKind::Io => self.max_io,
            DispatcherKind::CacheLookup | DispatcherKind::DelayedCacheLookup => {
                self.max_cache_lookup
            }
            DispatcherKind::ChooseWorkerCacheLookup
            | DispatcherKind::ChooseWorkerCpu
            | DispatcherKind::ChooseWorkerLight
            | DispatcherKind::ChooseWorkerIpc => self.max_choose_worker,
            DispatcherKind::Cpu => {
                if self.use_historical_cpu_throttling {
                    usize::MAX
                } else {
                    self.max_cpu
                }
            }
            DispatcherKind::Materialize => self.max_materialize,
            DispatcherKind::Light => self.max_light,
            DispatcherKind::IpcPips => self.max_ipc,
        }
    }
}

/// A queued pip waiting for admission.
#[derive(Clone, Eq, PartialEq, Debug)]
struct QueueEntry {
    priority: u32,
    pip: PipId,
    weight: u32,
    /// Set when the entry was pushed back after a semaphore block; sorts
    /// after every normal entry regardless of priority.
    deprioritized: bool,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: normal before deprioritized, then priority descending,
        // then PipId ascending.
        other
            .deprioritized
            .cmp(&self.deprioritized)
            .then(self.priority.cmp(&other.priority))
            .then(other.pip.cmp(&self.pip))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Observable per-queue counters.
#[derive(Debug, Default)]
struct QueueCounters {
    queued_total: AtomicU64,
    admitted_total: AtomicU64,
    semaphore_deferrals: AtomicU64,
    run_time_micros: AtomicU64,
}

/// A point-in-time view of one queue's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub running: usize,
    pub queued_total: u64,
    pub admitted_total: u64,
    pub semaphore_deferrals: u64,
    pub run_time: Duration,
}

struct Queue {
    cap: usize,
    running: AtomicUsize,
    heap: Mutex<BinaryHeap<QueueEntry>>,
    counters: QueueCounters,
}

/// The dispatcher. Cheap to share; all methods take `&self`.
pub struct Dispatcher {
    queues: HashMap<DispatcherKind, Queue>,
    cpu_permits: Arc<Semaphore>,
    limits: DispatchLimits,
    cancel: CancellationToken,
    changed: Notify,
}

/// An admitted pip: holds its queue slot (and CPU permits, for CPU
/// admissions) until dropped.
pub struct Admission {
    pub kind: DispatcherKind,
    pub pip: PipId,
    dispatcher: Arc<Dispatcher>,
    started: Instant,
    _permits: Option<OwnedSemaphorePermit>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        let queue = &self.dispatcher.queues[&self.kind];
        queue.running.fetch_sub(1, Ordering::SeqCst);
        queue.counters.run_time_micros.fetch_add(
            self.started.elapsed().as_micros() as u64,
            Ordering::Relaxed,
        );
        self.dispatcher.changed.notify_waiters();
        self.dispatcher.changed.notify_one();
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Admission({} on {})", self.pip, self.kind)
    }
}

impl Dispatcher {
    pub fn new(limits: DispatchLimits, cancel: CancellationToken) -> Arc<Self> {
        let queues = DispatcherKind::iter()
            .map(|kind| {
                (
                    kind,
                    Queue {
                        cap: limits.cap(kind),
                        running: AtomicUsize::new(0),
                        heap: Mutex::new(BinaryHeap::new()),
                        counters: QueueCounters::default(),
                    },
                )
            })
            .collect();

        Arc::new(Self {
            cpu_permits: Arc::new(Semaphore::new(limits.cpu_weight_permits)),
            queues,
            limits,
            cancel,
            changed: Notify::new(),
        })
    }

    /// Enqueue a pip on the named queue.
    ///
    /// Returns `false` (without queuing) once cancellation has begun: a
    /// canceling dispatcher accepts no new work.
    #[instrument(skip(self))]
    pub fn enqueue(&self, kind: DispatcherKind, pip: PipId, priority: u32, weight: u32) -> bool {
        if self.cancel.is_cancelled() {
            trace!(%pip, "refusing enqueue, dispatcher canceling");
            return false;
        }

        let queue = &self.queues[&kind];
        queue.counters.queued_total.fetch_add(1, Ordering::Relaxed);
        queue.heap.lock().expect("queue lock").push(QueueEntry {
            priority,
            pip,
            weight,
            deprioritized: false,
        });
        self.changed.notify_one();
        true
    }

    /// Offer admissions from every queue with capacity, highest priority
    /// first, until each queue's budget is exhausted or it has no
    /// candidate.
    pub fn poll_admissions(self: &Arc<Self>) -> Vec<Admission> {
        let mut admissions = Vec::new();
        for kind in DispatcherKind::iter() {
            self.poll_queue(kind, &mut admissions);
        }
        admissions
    }

    fn poll_queue(self: &Arc<Self>, kind: DispatcherKind, admissions: &mut Vec<Admission>) {
        let queue = &self.queues[&kind];
        // Entries that could not be admitted this poll; pushed back at the
        // end so each entry is considered at most once per poll.
        let mut deferred = Vec::new();

        loop {
            if queue.running.load(Ordering::SeqCst) >= queue.cap {
                break;
            }

            let Some(entry) = queue.heap.lock().expect("queue lock").pop() else {
                break;
            };

            let permits = if kind == DispatcherKind::Cpu {
                let weight = entry
                    .weight
                    .min(self.limits.cpu_weight_permits as u32)
                    .max(1);
                match self.cpu_permits.clone().try_acquire_many_owned(weight) {
                    Ok(permits) => Some(permits),
                    Err(_) => {
                        queue
                            .counters
                            .semaphore_deferrals
                            .fetch_add(1, Ordering::Relaxed);
                        if self.limits.deprioritize_on_semaphore_block {
                            // Let lighter work pass the blocked head.
                            deferred.push(QueueEntry {
                                deprioritized: true,
                                ..entry
                            });
                            continue;
                        }
                        deferred.push(entry);
                        break;
                    }
                }
            } else {
                None
            };

            queue.running.fetch_add(1, Ordering::SeqCst);
            queue.counters.admitted_total.fetch_add(1, Ordering::Relaxed);
            admissions.push(Admission {
                kind,
                pip: entry.pip,
                dispatcher: self.clone(),
                started: Instant::now(),
                _permits: permits,
            });
        }

        if !deferred.is_empty() {
            let mut heap = queue.heap.lock().expect("queue lock");
            for entry in deferred {
                heap.push(entry);
            }
        }
    }

    /// Wait until the dispatcher state may have changed (an admission
    /// finished or work was enqueued), or cancellation was requested.
    pub async fn changed(&self) {
        tokio::select! {
            _ = self.changed.notified() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_canceling(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The total number of currently running admissions.
    pub fn running(&self) -> usize {
        self.queues
            .values()
            .map(|q| q.running.load(Ordering::SeqCst))
            .sum()
    }

    /// The total number of queued (not yet admitted) pips.
    pub fn queued(&self) -> usize {
        self.queues
            .values()
            .map(|q| q.heap.lock().expect("queue lock").len())
            .sum()
    }

    /// Wait for in-flight admissions to finish after cancellation.
    ///
    /// `timeout` of `None` waits indefinitely (the default build behavior);
    /// with a timeout, the call returns `false` if work was still
    /// outstanding when the window closed.
    #[instrument(skip(self))]
    pub async fn drain(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.running() == 0 {
                return true;
            }
            match deadline {
                None => self.changed.notified().await,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        debug!(outstanding = self.running(), "drain window expired");
                        return false;
                    }
                    let _ = tokio::time::timeout(remaining, self.changed.notified()).await;
                }
            }
        }
    }

    /// A point-in-time view of one queue.
    pub fn snapshot(&self, kind: DispatcherKind) -> QueueSnapshot {
        let queue = &self.queues[&kind];
        QueueSnapshot {
            queued: queue.heap.lock().expect("queue lock").len(),
            running: queue.running.load(Ordering::SeqCst),
            queued_total: queue.counters.queued_total.load(Ordering::Relaxed),
            admitted_total: queue.counters.admitted_total.load(Ordering::Relaxed),
            semaphore_deferrals: queue.counters.semaphore_deferrals.load(Ordering::Relaxed),
            run_time: Duration::from_micros(
                queue.counters.run_time_micros.load(Ordering::Relaxed),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn limits() -> DispatchLimits {
        DispatchLimits {
            max_io: 1,
            max_cache_lookup: 2,
            max_choose_worker: 1,
            max_cpu: 2,
            max_materialize: 1,
            max_light: 4,
            max_ipc: 1,
            cpu_weight_permits: 4,
            use_historical_cpu_throttling: false,
            deprioritize_on_semaphore_block: true,
        }
    }

    #[tokio::test]
    async fn priority_orders_admissions() {
        let dispatcher = Dispatcher::new(limits(), CancellationToken::new());
        dispatcher.enqueue(DispatcherKind::CacheLookup, PipId(1), 1, 1);
        dispatcher.enqueue(DispatcherKind::CacheLookup, PipId(2), 9, 1);
        dispatcher.enqueue(DispatcherKind::CacheLookup, PipId(3), 5, 1);

        let admissions = dispatcher.poll_admissions();
        let pips = admissions.iter().map(|a| a.pip).collect::<Vec<_>>();
        // Cap is 2: the two highest priorities win.
        pretty_assert_eq!(pips, vec![PipId(2), PipId(3)]);

        drop(admissions);
        let pips = dispatcher
            .poll_admissions()
            .iter()
            .map(|a| a.pip)
            .collect::<Vec<_>>();
        pretty_assert_eq!(pips, vec![PipId(1)]);
    }

    #[tokio::test]
    async fn ties_break_by_pip_id() {
        let dispatcher = Dispatcher::new(limits(), CancellationToken::new());
        dispatcher.enqueue(DispatcherKind::CacheLookup, PipId(7), 5, 1);
        dispatcher.enqueue(DispatcherKind::CacheLookup, PipId(3), 5, 1);

        let admissions = dispatcher.poll_admissions();
        pretty_assert_eq!(admissions[0].pip, PipId(3));
    }

    #[tokio::test]
    async fn cpu_weight_blocks_do_not_stall_queue() {
        let dispatcher = Dispatcher::new(limits(), CancellationToken::new());
        // Weight 3 of 4 permits: one permit stays available.
        dispatcher.enqueue(DispatcherKind::Cpu, PipId(1), 0, 3);
        let heavy = dispatcher.poll_admissions();
        pretty_assert_eq!(heavy.len(), 1);

        // A higher-priority heavy pip blocks on permits, but the light pip
        // behind it is still admitted.
        dispatcher.enqueue(DispatcherKind::Cpu, PipId(2), 9, 4);
        dispatcher.enqueue(DispatcherKind::Cpu, PipId(3), 1, 1);
        let light = dispatcher.poll_admissions();
        pretty_assert_eq!(light.len(), 1);
        pretty_assert_eq!(light[0].pip, PipId(3));

        let snapshot = dispatcher.snapshot(DispatcherKind::Cpu);
        assert!(snapshot.semaphore_deferrals >= 1);

        // Releasing the heavy admission frees permits for the blocked head.
        drop(heavy);
        drop(light);
        let resumed = dispatcher.poll_admissions();
        pretty_assert_eq!(resumed[0].pip, PipId(2));
    }

    #[tokio::test]
    async fn canceling_refuses_new_work() {
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(limits(), cancel.clone());
        cancel.cancel();
        assert!(!dispatcher.enqueue(DispatcherKind::Light, PipId(1), 0, 1));
        pretty_assert_eq!(dispatcher.queued(), 0);
    }

    #[tokio::test]
    async fn drain_times_out_with_outstanding_work() {
        let dispatcher = Dispatcher::new(limits(), CancellationToken::new());
        dispatcher.enqueue(DispatcherKind::Light, PipId(1), 0, 1);
        let admissions = dispatcher.poll_admissions();
        pretty_assert_eq!(admissions.len(), 1);

        let drained = dispatcher.drain(Some(Duration::from_millis(20))).await;
        assert!(!drained);

        drop(admissions);
        let drained = dispatcher.drain(Some(Duration::from_millis(20))).await;
        assert!(drained);
    }

    #[tokio::test]
    async fn historical_throttling_unbounds_cpu_count() {
        let mut limits = limits();
        limits.use_historical_cpu_throttling = true;
        limits.cpu_weight_permits = 3;
        let dispatcher = Dispatcher::new(limits, CancellationToken::new());

        for i in 0..3 {
            dispatcher.enqueue(DispatcherKind::Cpu, PipId(i), 0, 1);
        }
        // All three admit despite max_cpu = 2, because the count cap is
        // lifted and three weight permits exist.
        let admissions = dispatcher.poll_admissions();
        pretty_assert_eq!(admissions.len(), 3);
    }
}
