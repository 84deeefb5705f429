//! The execution sandbox surface.
//!
//! The engine does not implement OS-level interception itself; it consumes
//! a "launch and observe" service through the [`Monitor`] trait. A monitor
//! launches a child process described by a [`ProcessSpec`] and yields a
//! finite stream of [`AccessEvent`]s in the order the host observed them.
//! The engine turns that stream into observations, violations, and
//! fingerprints in [`policy`].
//!
//! Two monitors ship with the crate: [`UnobservedLauncher`] runs the child
//! for real without file observation (process start/exit events only), and
//! [`ScriptedMonitor`] replays canned events for tests.

pub mod breakaway;
pub mod opaque;
pub mod policy;

use std::{collections::BTreeMap, path::PathBuf, process::Stdio};

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace};

use wire::ContentHash;

/// Everything a monitor needs to launch and observe one process pip.
#[derive(Clone, Debug, Builder)]
pub struct ProcessSpec {
    pub executable: PathBuf,
    #[builder(default)]
    pub arguments: Vec<String>,
    pub working_dir: PathBuf,
    #[builder(default)]
    pub env: BTreeMap<String, String>,
    /// Declared file inputs; reads of these are never violations.
    #[builder(default)]
    pub declared_inputs: Vec<PathBuf>,
    /// Roots under which writes are permitted.
    #[builder(default)]
    pub output_roots: Vec<PathBuf>,
    /// Scopes in which accesses are not observed at all.
    #[builder(default)]
    pub untracked_scopes: Vec<PathBuf>,
    /// Scopes from which undeclared reads are allowed.
    #[builder(default)]
    pub allowed_scopes: Vec<PathBuf>,
}

/// One observed access, in host observation order.
///
/// For two events on the same handle, program order is preserved by the
/// monitor; the engine relies on that only for `ProcessStart`/`ProcessExit`
/// pairing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessEvent {
    Read {
        pid: u32,
        path: PathBuf,
        /// Present when the monitor hashed the content on the way through.
        hash: Option<ContentHash>,
    },
    Probe {
        pid: u32,
        path: PathBuf,
        existed: bool,
    },
    Write {
        pid: u32,
        path: PathBuf,
    },
    Enumerate {
        pid: u32,
        path: PathBuf,
        /// `(name, is_dir)` member pairs.
        members: Vec<(String, bool)>,
    },
    ProcessStart {
        pid: u32,
        parent: u32,
        executable: PathBuf,
        arguments: Vec<String>,
    },
    ProcessExit {
        pid: u32,
        exit_code: i32,
    },
}

impl AccessEvent {
    /// The pid the event is attributed to.
    pub fn pid(&self) -> u32 {
        match self {
            AccessEvent::Read { pid, .. }
            | AccessEvent::Probe { pid, .. }
            | AccessEvent::Write { pid, .. }
            | AccessEvent::Enumerate { pid, .. }
            | AccessEvent::ProcessStart { pid, .. }
            | AccessEvent::ProcessExit { pid, .. } => *pid,
        }
    }
}

/// A launched child: a finite event stream plus the eventual exit code.
pub struct LaunchedProcess {
    events: flume::Receiver<AccessEvent>,
    exit: oneshot::Receiver<Result<i32>>,
}

impl LaunchedProcess {
    pub fn new(
        events: flume::Receiver<AccessEvent>,
        exit: oneshot::Receiver<Result<i32>>,
    ) -> Self {
        Self { events, exit }
    }

    /// Drain the event stream and wait for exit.
    #[instrument(skip(self))]
    pub async fn collect(self) -> Result<ObservedExecution> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.recv_async().await {
            trace!(?event, "observed access");
            events.push(event);
        }
        let exit_code = self
            .exit
            .await
            .context("monitor dropped without reporting exit")??;
        debug!(events = events.len(), exit_code, "process finished");
        Ok(ObservedExecution { events, exit_code })
    }
}

/// The complete observation of one process execution.
#[derive(Clone, Debug)]
pub struct ObservedExecution {
    pub events: Vec<AccessEvent>,
    pub exit_code: i32,
}

/// A service that can launch a process and observe its filesystem accesses.
pub trait Monitor: Send + Sync + 'static {
    fn launch(&self, spec: ProcessSpec) -> impl Future<Output = Result<LaunchedProcess>> + Send;
}

/// Launches processes for real without file observation.
///
/// Suitable for hosts where the interception service is unavailable; pips
/// run this way report only process start and exit, so they observe an
/// empty path set and carry no violations.
#[derive(Clone, Debug, Default)]
pub struct UnobservedLauncher;

impl Monitor for UnobservedLauncher {
    #[instrument(skip_all, fields(executable = ?spec.executable))]
    async fn launch(&self, spec: ProcessSpec) -> Result<LaunchedProcess> {
        let (event_tx, event_rx) = flume::unbounded();
        let (exit_tx, exit_rx) = oneshot::channel();

        let mut command = tokio::process::Command::new(&spec.executable);
        command
            .args(&spec.arguments)
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(&spec.env)
            // Output capture belongs to the observing monitor; this
            // launcher discards it rather than risk a full pipe blocking
            // the child.
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn {:?}", spec.executable))?;
        let pid = child.id().unwrap_or_default();

        let _ = event_tx.send(AccessEvent::ProcessStart {
            pid,
            parent: std::process::id(),
            executable: spec.executable.clone(),
            arguments: spec.arguments.clone(),
        });

        tokio::spawn(async move {
            let outcome = async {
                let status = child.wait().await.context("wait for child")?;
                let exit_code = status.code().unwrap_or(-1);
                let _ = event_tx.send(AccessEvent::ProcessExit { pid, exit_code });
                drop(event_tx);
                Ok(exit_code)
            }
            .await;
            let _ = exit_tx.send(outcome);
        });

        Ok(LaunchedProcess::new(event_rx, exit_rx))
    }
}

/// Replays canned events instead of running anything.
///
/// The workhorse of sandbox-dependent tests: construct with the exact event
/// stream a real monitor would have produced and the exit code to report.
#[derive(Clone, Debug)]
pub struct ScriptedMonitor {
    events: Vec<AccessEvent>,
    exit_code: i32,
}

impl ScriptedMonitor {
    pub fn new(events: Vec<AccessEvent>, exit_code: i32) -> Self {
        Self { events, exit_code }
    }

    /// A monitor that reports a clean run with no observations.
    pub fn silent() -> Self {
        Self::new(Vec::new(), 0)
    }
}

impl Monitor for ScriptedMonitor {
    async fn launch(&self, _spec: ProcessSpec) -> Result<LaunchedProcess> {
        let (event_tx, event_rx) = flume::unbounded();
        let (exit_tx, exit_rx) = oneshot::channel();

        for event in self.events.clone() {
            let _ = event_tx.send(event);
        }
        drop(event_tx);
        let _ = exit_tx.send(Ok(self.exit_code));

        Ok(LaunchedProcess::new(event_rx, exit_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[tokio::test]
    async fn scripted_monitor_replays_events() {
        let events = vec![
            AccessEvent::Read {
                pid: 1,
                path: PathBuf::from("/src/a"),
                hash: None,
            },
            AccessEvent::ProcessExit {
                pid: 1,
                exit_code: 0,
            },
        ];
        let monitor = ScriptedMonitor::new(events.clone(), 0);
        let spec = ProcessSpec::builder()
            .executable(PathBuf::from("/bin/true"))
            .working_dir(PathBuf::from("/"))
            .build();

        let observed = monitor.launch(spec).await.unwrap().collect().await.unwrap();
        pretty_assert_eq!(observed.events, events);
        pretty_assert_eq!(observed.exit_code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unobserved_launcher_runs_real_processes() {
        let monitor = UnobservedLauncher;
        let spec = ProcessSpec::builder()
            .executable(PathBuf::from("/bin/sh"))
            .arguments(vec!["-c".into(), "exit 3".into()])
            .working_dir(std::env::temp_dir())
            .build();

        let observed = monitor.launch(spec).await.unwrap().collect().await.unwrap();
        pretty_assert_eq!(observed.exit_code, 3);
        assert!(matches!(
            observed.events.first(),
            Some(AccessEvent::ProcessStart { .. })
        ));
        assert!(matches!(
            observed.events.last(),
            Some(AccessEvent::ProcessExit { exit_code: 3, .. })
        ));
    }
}
