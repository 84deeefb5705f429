//! Shared harness for the end-to-end build tests.
//!
//! A [`TestCluster`] simulates a set of machines sharing a remote metadata
//! store and a global content-location directory; each [`Machine`] has its
//! own local content store. Builds run with a scriptable monitor, so tests
//! control exactly what a "tool" reads, writes, and enumerates.

#![allow(dead_code, reason = "Each test binary uses a subset of the harness")]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use kiln::{
    cas::{
        ContentStore,
        directory::InMemoryGlobalDirectory,
        local::LocalCas,
        remote::InProcessPeer,
    },
    config::EngineConfig,
    dispatch::Dispatcher,
    engine::{Build, BuildSummary},
    error::CriticalErrorChannel,
    exec::{BuildCounters, NullRelay, PipExecutor},
    fs,
    graph::PipGraph,
    opaque::SharedOpaqueTracker,
    sandbox::{AccessEvent, LaunchedProcess, Monitor, ProcessSpec},
    translate::DirectoryTranslator,
    twophase::MetadataStore,
};

/// A monitor that performs scripted filesystem effects, then reports the
/// scripted events: what a real sandboxed tool run looks like from the
/// engine's side.
#[derive(Clone, Debug, Default)]
pub struct FakeTool {
    pub writes: Vec<(PathBuf, Vec<u8>)>,
    pub events: Vec<AccessEvent>,
    pub exit_code: i32,
}

impl FakeTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writing(mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.writes.push((path.into(), contents.into()));
        self
    }

    pub fn reporting(mut self, events: Vec<AccessEvent>) -> Self {
        self.events = events;
        self
    }
}

impl Monitor for FakeTool {
    async fn launch(&self, _spec: ProcessSpec) -> color_eyre::Result<LaunchedProcess> {
        for (path, contents) in &self.writes {
            fs::write(path, contents).await?;
        }

        let (event_tx, event_rx) = flume::unbounded();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        for event in self.events.clone() {
            let _ = event_tx.send(event);
        }
        drop(event_tx);
        let _ = exit_tx.send(Ok(self.exit_code));
        Ok(LaunchedProcess::new(event_rx, exit_rx))
    }
}

/// The shared "remote" side of a simulated cluster.
pub struct TestCluster {
    pub dir: TempDir,
    pub global: InMemoryGlobalDirectory,
    pub metadata: Arc<MetadataStore>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create cluster tempdir"),
            global: InMemoryGlobalDirectory::new(),
            metadata: MetadataStore::in_memory(Duration::from_secs(600))
                .expect("open metadata store"),
        }
    }

    /// A workspace path under the cluster's tempdir.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Create a machine with its own local store.
    pub fn machine(&self, name: &str, peers: Vec<InProcessPeer>) -> Machine {
        let cas = LocalCas::new(self.dir.path().join(format!("cas-{name}")));
        let store = ContentStore::new(
            cas.clone(),
            wire::dist::v1::MachineLocation::new(format!("cas://{name}")),
            self.global.clone(),
            peers,
            kiln::config::PinConfig::default(),
            8,
            CancellationToken::new(),
        );
        Machine {
            name: name.to_string(),
            cas,
            store,
        }
    }

    /// An in-process peer view of a machine's local store.
    pub fn peer_of(&self, machine: &Machine) -> InProcessPeer {
        InProcessPeer::new(
            wire::dist::v1::MachineLocation::new(format!("cas://{}", machine.name)),
            machine.cas.clone(),
        )
    }
}

/// One simulated machine.
pub struct Machine {
    pub name: String,
    pub cas: LocalCas,
    pub store: ContentStore<InProcessPeer, InMemoryGlobalDirectory>,
}

/// Run one build of the graph on the machine with the given monitor.
pub async fn run_build<M: Monitor>(
    cluster: &TestCluster,
    machine: &Machine,
    graph: Arc<PipGraph>,
    monitor: M,
    config: EngineConfig,
) -> (BuildSummary, Arc<BuildCounters>) {
    let config = Arc::new(config);
    let cancel = CancellationToken::new();
    let counters = Arc::new(BuildCounters::default());
    let session_id = Uuid::new_v4();

    let tracker = SharedOpaqueTracker::new(
        cluster.dir.path().join(format!("sideband-{}", machine.name)),
        machine.name.clone(),
        config.sandbox.mark_policy,
        config.sandbox.follow_symlinks_for_marks,
        config.sandbox.cas_keeps_hardlink,
    );

    let executor = Arc::new(PipExecutor::new(
        graph.clone(),
        machine.store.clone(),
        cluster.metadata.clone(),
        Arc::new(monitor),
        Arc::new(NullRelay),
        Arc::new(DirectoryTranslator::empty()),
        config.clone(),
        session_id,
        tracker,
        counters.clone(),
        cancel.clone(),
    ));

    let dispatcher = Dispatcher::new(config.limits.clone(), cancel.clone());
    let build = Build::new(
        graph,
        executor,
        dispatcher,
        counters.clone(),
        config,
        CriticalErrorChannel::new(),
        None,
        cancel,
        session_id,
    );
    let summary = build.run().await.expect("build run");
    (summary, counters)
}

/// Read a file's contents, failing the test if it is missing.
pub async fn read(path: &Path) -> Vec<u8> {
    fs::must_read_buffered(path).await.expect("read file")
}
