//! Distributed execution: orchestrator and worker services.
//!
//! The orchestrator owns the pip graph and the schedule; workers execute
//! pips and stream results back. The wire surface is the `wire::dist::v1`
//! message set over HTTP (see [`http`]); this module holds the pieces both
//! roles share: portable pip rendering, sequence-number discipline, and
//! perf sampling for heartbeats.

pub mod http;
pub mod orchestrator;
pub mod worker;

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use wire::dist::v1::WorkerId;

use crate::{
    graph::PipGraph,
    paths::PathTable,
    pip::{
        CopyFilePip, DirectoryArtifact, EnvSpec, FileArtifact, IpcPip, Pip, PipPayload,
        ProcessPip, SealDirectoryPip, SealKind, WriteFilePip,
    },
};

/// A pip rendered with string paths, so it survives the trip to a machine
/// with a different path table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortablePip {
    pub semi_stable_hash: u64,
    pub priority: u32,
    pub weight: u32,
    pub tags: Vec<String>,
    pub payload: PortablePayload,
}

/// A portable file artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortableFile {
    pub path: String,
    pub rewrite_count: u32,
}

/// A portable directory artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortableDirectory {
    pub path: String,
    pub seal_id: u32,
    pub kind: SealKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PortablePayload {
    Process {
        executable: String,
        arguments: Vec<String>,
        working_dir: String,
        env: BTreeMap<String, EnvSpec>,
        inputs: Vec<PortableFile>,
        input_dirs: Vec<PortableDirectory>,
        outputs: Vec<PortableFile>,
        output_dirs: Vec<PortableDirectory>,
        untracked_scopes: Vec<String>,
        allowed_undeclared_scopes: Vec<String>,
        disable_cache_lookup: bool,
    },
    WriteFile {
        destination: PortableFile,
        contents: String,
    },
    CopyFile {
        source: PortableFile,
        destination: PortableFile,
    },
    SealDirectory {
        directory: PortableDirectory,
        contents: Vec<PortableFile>,
    },
    Ipc {
        moniker: String,
        payload: String,
        inputs: Vec<PortableFile>,
        outputs: Vec<PortableFile>,
    },
    Meta,
}

/// Render a pip into its portable form.
pub fn render_pip(graph: &PipGraph, pip: &Pip) -> PortablePip {
    let paths = graph.paths();
    let file = |artifact: &FileArtifact| PortableFile {
        path: paths.resolve_lossy(artifact.path),
        rewrite_count: artifact.rewrite_count,
    };
    let dir = |artifact: &DirectoryArtifact| PortableDirectory {
        path: paths.resolve_lossy(artifact.path),
        seal_id: artifact.seal_id,
        kind: artifact.kind,
    };

    let payload = match &pip.payload {
        PipPayload::Process(p) => PortablePayload::Process {
            executable: paths.resolve_lossy(p.executable),
            arguments: p.arguments.clone(),
            working_dir: paths.resolve_lossy(p.working_dir),
            env: p.env.clone(),
            inputs: p.inputs.iter().map(file).collect(),
            input_dirs: p.input_dirs.iter().map(dir).collect(),
            outputs: p.outputs.iter().map(file).collect(),
            output_dirs: p.output_dirs.iter().map(dir).collect(),
            untracked_scopes: p
                .untracked_scopes
                .iter()
                .map(|p| paths.resolve_lossy(*p))
                .collect(),
            allowed_undeclared_scopes: p
                .allowed_undeclared_scopes
                .iter()
                .map(|p| paths.resolve_lossy(*p))
                .collect(),
            disable_cache_lookup: p.disable_cache_lookup,
        },
        PipPayload::WriteFile(p) => PortablePayload::WriteFile {
            destination: file(&p.destination),
            contents: p.contents.clone(),
        },
        PipPayload::CopyFile(p) => PortablePayload::CopyFile {
            source: file(&p.source),
            destination: file(&p.destination),
        },
        PipPayload::SealDirectory(p) => PortablePayload::SealDirectory {
            directory: dir(&p.directory),
            contents: p.contents.iter().map(file).collect(),
        },
        PipPayload::Ipc(p) => PortablePayload::Ipc {
            moniker: p.moniker.clone(),
            payload: p.payload.clone(),
            inputs: p.inputs.iter().map(file).collect(),
            outputs: p.outputs.iter().map(file).collect(),
        },
        PipPayload::Meta => PortablePayload::Meta,
    };

    PortablePip {
        semi_stable_hash: pip.semi_stable_hash.0,
        priority: pip.priority,
        weight: pip.weight,
        tags: pip.tags.clone(),
        payload,
    }
}

/// Intern a portable payload into a local path table.
pub fn intern_payload(portable: &PortablePayload, paths: &PathTable) -> Result<PipPayload> {
    let file = |artifact: &PortableFile| -> Result<FileArtifact> {
        Ok(FileArtifact {
            path: paths.intern(&artifact.path)?,
            rewrite_count: artifact.rewrite_count,
        })
    };
    let dir = |artifact: &PortableDirectory| -> Result<DirectoryArtifact> {
        Ok(DirectoryArtifact {
            path: paths.intern(&artifact.path)?,
            seal_id: artifact.seal_id,
            kind: artifact.kind,
        })
    };
    let files = |artifacts: &[PortableFile]| -> Result<Vec<FileArtifact>> {
        artifacts.iter().map(file).collect()
    };
    let dirs = |artifacts: &[PortableDirectory]| -> Result<Vec<DirectoryArtifact>> {
        artifacts.iter().map(dir).collect()
    };

    Ok(match portable {
        PortablePayload::Process {
            executable,
            arguments,
            working_dir,
            env,
            inputs,
            input_dirs,
            outputs,
            output_dirs,
            untracked_scopes,
            allowed_undeclared_scopes,
            disable_cache_lookup,
        } => PipPayload::Process(ProcessPip {
            executable: paths.intern(executable).context("intern executable")?,
            arguments: arguments.clone(),
            working_dir: paths.intern(working_dir).context("intern working dir")?,
            env: env.clone(),
            inputs: files(inputs)?,
            input_dirs: dirs(input_dirs)?,
            outputs: files(outputs)?,
            output_dirs: dirs(output_dirs)?,
            untracked_scopes: untracked_scopes
                .iter()
                .map(|p| paths.intern(p))
                .collect::<Result<_>>()?,
            allowed_undeclared_scopes: allowed_undeclared_scopes
                .iter()
                .map(|p| paths.intern(p))
                .collect::<Result<_>>()?,
            disable_cache_lookup: *disable_cache_lookup,
        }),
        PortablePayload::WriteFile {
            destination,
            contents,
        } => PipPayload::WriteFile(WriteFilePip {
            destination: file(destination)?,
            contents: contents.clone(),
        }),
        PortablePayload::CopyFile {
            source,
            destination,
        } => PipPayload::CopyFile(CopyFilePip {
            source: file(source)?,
            destination: file(destination)?,
        }),
        PortablePayload::SealDirectory {
            directory,
            contents,
        } => PipPayload::SealDirectory(SealDirectoryPip {
            directory: dir(directory)?,
            contents: files(contents)?,
        }),
        PortablePayload::Ipc {
            moniker,
            payload,
            inputs,
            outputs,
        } => PipPayload::Ipc(IpcPip {
            moniker: moniker.clone(),
            payload: payload.clone(),
            inputs: files(inputs)?,
            outputs: files(outputs)?,
        }),
        PortablePayload::Meta => PipPayload::Meta,
    })
}

/// Per-worker sequence-number acceptance.
///
/// Senders number each streamed message monotonically; receivers keep the
/// set of numbers already ingested and drop repeats, which is what makes
/// resubmission after a partial ingestion failure idempotent. Messages may
/// arrive out of order (transport requests race); only exact repeats are
/// dropped.
#[derive(Debug, Default)]
pub struct SequenceGate {
    seen: DashMap<WorkerId, std::collections::BTreeSet<u64>>,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a sequence number; `false` means duplicate.
    pub fn accept(&self, worker: WorkerId, sequence: u64) -> bool {
        let accepted = self.seen.entry(worker).or_default().insert(sequence);
        if !accepted {
            trace!(%worker, sequence, "dropping duplicate sequence");
        }
        accepted
    }
}

/// Sample machine and engine-process CPU/RAM for a heartbeat.
pub fn perf_snapshot() -> wire::dist::v1::PerfSnapshot {
    use sysinfo::System;

    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu_usage();
    let machine_ram_mb = system.used_memory() / (1024 * 1024);
    let machine_cpu_percent = system.global_cpu_usage();

    let (engine_cpu_percent, engine_ram_mb) = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| {
            system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            system
                .process(pid)
                .map(|p| (p.cpu_usage(), p.memory() / (1024 * 1024)))
        })
        .unwrap_or_default();

    wire::dist::v1::PerfSnapshot {
        machine_cpu_percent,
        machine_ram_mb,
        engine_cpu_percent,
        engine_ram_mb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use std::sync::Arc;

    #[test]
    fn sequence_gate_drops_duplicates_but_accepts_out_of_order() {
        let gate = SequenceGate::new();
        let worker = WorkerId(1);

        assert!(gate.accept(worker, 2));
        assert!(gate.accept(worker, 1));
        assert!(!gate.accept(worker, 2));
        assert!(!gate.accept(worker, 1));
        assert!(gate.accept(worker, 3));

        // Another worker's stream is independent.
        assert!(gate.accept(WorkerId(2), 1));
    }

    #[test]
    fn portable_pip_round_trips_across_tables() {
        let source = Arc::new(PathTable::new());
        let mut builder = crate::graph::PipGraphBuilder::new(source.clone());
        let id = builder.add_pip(
            PipPayload::WriteFile(WriteFilePip {
                destination: FileArtifact::output(source.intern("/out/a").unwrap()),
                contents: "42".into(),
            }),
            5,
            2,
            vec!["tag".into()],
        );
        let graph = builder.build().unwrap();
        let pip = graph.pip(id).unwrap();

        let portable = render_pip(&graph, pip);
        pretty_assert_eq!(portable.priority, 5);

        let other_table = PathTable::new();
        other_table.intern("/something/else").unwrap();
        let payload = intern_payload(&portable.payload, &other_table).unwrap();
        match payload {
            PipPayload::WriteFile(write) => {
                pretty_assert_eq!(
                    other_table.resolve_lossy(write.destination.path),
                    "/out/a"
                );
                pretty_assert_eq!(write.contents, "42");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
