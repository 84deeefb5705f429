//! Pips: the units of work in a build graph.
//!
//! A pip is a single schedulable step. Process executions are the
//! interesting case; file writes, copies, directory seals, IPC calls, and
//! meta pips exist so the whole build is expressible as one graph with one
//! scheduling policy. Pips are modeled as a tagged variant with per-kind
//! payloads; dispatch throughout the engine is by variant tag.

use std::collections::BTreeMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumDiscriminants, EnumString};

use crate::{dispatch::DispatcherKind, paths::PathId};

/// Dense pip identifier within one build graph.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("pip{_0}")]
pub struct PipId(pub u32);

/// A pip identity that is stable across builds of the same specification,
/// used for logs, cross-build correlation, and per-pip overrides.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("Pip{_0:016X}")]
pub struct SemiStableHash(pub u64);

/// A file as an artifact of the build: a path plus the number of times the
/// build has rewritten it. Rewrite count zero is a source file; a positive
/// count is an output produced by exactly one pip.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct FileArtifact {
    pub path: PathId,
    pub rewrite_count: u32,
}

impl FileArtifact {
    /// A source artifact (rewrite count zero).
    pub fn source(path: PathId) -> Self {
        Self {
            path,
            rewrite_count: 0,
        }
    }

    /// An output artifact (first rewrite).
    pub fn output(path: PathId) -> Self {
        Self {
            path,
            rewrite_count: 1,
        }
    }

    pub fn is_source(&self) -> bool {
        self.rewrite_count == 0
    }
}

/// How a directory artifact's membership is declared.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, StrumDisplay, EnumString,
    Serialize, Deserialize,
)]
pub enum SealKind {
    /// Every member is statically declared; enumeration is answered from the
    /// declaration.
    Full,
    /// A declared subset of the directory; members outside the seal are not
    /// visible through it.
    Partial,
    /// A source directory sealed recursively.
    SourceAllDirectories,
    /// A source directory sealed at the top level only.
    SourceTopDirectoryOnly,
    /// An output directory with exactly one producer; contents are observed,
    /// not declared.
    ExclusiveOpaque,
    /// An output directory multiple pips may write into; contents are
    /// observed and attributed by producer marks.
    SharedOpaque,
}

impl SealKind {
    /// Whether membership is observed at execution time rather than
    /// declared.
    pub fn is_opaque(&self) -> bool {
        matches!(self, SealKind::ExclusiveOpaque | SealKind::SharedOpaque)
    }

    /// Whether the directory is made of source files.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            SealKind::SourceAllDirectories | SealKind::SourceTopDirectoryOnly
        )
    }
}

/// A sealed directory as an artifact of the build.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct DirectoryArtifact {
    pub path: PathId,
    /// Distinguishes multiple seals of the same directory path.
    pub seal_id: u32,
    pub kind: SealKind,
}

/// How an environment variable participates in fingerprinting.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum EnvSpec {
    /// The value is part of the pip's identity. `None` records a variable
    /// that is declared but unset, which fingerprints differently from every
    /// set value.
    Tracked(Option<String>),
    /// Only the name is part of the pip's identity; the value flows through
    /// to the process without affecting caching.
    Passthrough,
}

/// A process execution pip.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ProcessPip {
    pub executable: PathId,
    pub arguments: Vec<String>,
    pub working_dir: PathId,
    pub env: BTreeMap<String, EnvSpec>,
    /// Statically declared file inputs.
    pub inputs: Vec<FileArtifact>,
    /// Statically declared directory inputs (seals).
    pub input_dirs: Vec<DirectoryArtifact>,
    /// Statically declared file outputs.
    pub outputs: Vec<FileArtifact>,
    /// Declared output directories, including opaque kinds.
    pub output_dirs: Vec<DirectoryArtifact>,
    /// Scopes in which accesses are not observed at all.
    pub untracked_scopes: Vec<PathId>,
    /// Scopes from which undeclared reads are allowed.
    pub allowed_undeclared_scopes: Vec<PathId>,
    /// When set, the pip always executes; its results are still published
    /// unless execution makes it uncacheable.
    pub disable_cache_lookup: bool,
}

/// A pip that writes fixed contents to a file.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct WriteFilePip {
    pub destination: FileArtifact,
    pub contents: String,
}

/// A pip that copies one file to another path.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct CopyFilePip {
    pub source: FileArtifact,
    pub destination: FileArtifact,
}

/// A pip that seals a directory view.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct SealDirectoryPip {
    pub directory: DirectoryArtifact,
    /// Declared members; empty for opaque seals.
    pub contents: Vec<FileArtifact>,
}

/// A pip that performs an IPC call against a service pip.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct IpcPip {
    /// Identifies the service endpoint the call is routed to.
    pub moniker: String,
    pub payload: String,
    /// Input files the message payload references.
    pub inputs: Vec<FileArtifact>,
    pub outputs: Vec<FileArtifact>,
}

/// The per-kind pip payload.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize, EnumDiscriminants)]
#[strum_discriminants(name(PipKind), derive(StrumDisplay, Hash))]
pub enum PipPayload {
    Process(ProcessPip),
    WriteFile(WriteFilePip),
    CopyFile(CopyFilePip),
    SealDirectory(SealDirectoryPip),
    Ipc(IpcPip),
    /// Value, source-hash, and module pips: scheduling skeleton with no
    /// filesystem effect.
    Meta,
}

/// One unit of work in the build graph.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Pip {
    pub id: PipId,
    pub semi_stable_hash: SemiStableHash,
    /// Scheduling priority; larger runs earlier. Ties break by PipId.
    pub priority: u32,
    /// Expected-peak resource weight, in CPU-semaphore permits.
    pub weight: u32,
    pub tags: Vec<String>,
    pub payload: PipPayload,
}

impl Pip {
    pub fn kind(&self) -> PipKind {
        PipKind::from(&self.payload)
    }

    /// The process payload, when this is a process pip.
    pub fn as_process(&self) -> Option<&ProcessPip> {
        match &self.payload {
            PipPayload::Process(process) => Some(process),
            _ => None,
        }
    }

    /// All file outputs this pip declares, across payload kinds.
    pub fn declared_file_outputs(&self) -> Vec<FileArtifact> {
        match &self.payload {
            PipPayload::Process(p) => p.outputs.clone(),
            PipPayload::WriteFile(p) => vec![p.destination],
            PipPayload::CopyFile(p) => vec![p.destination],
            PipPayload::SealDirectory(_) | PipPayload::Meta => Vec::new(),
            PipPayload::Ipc(p) => p.outputs.clone(),
        }
    }

    /// All file inputs this pip declares, across payload kinds.
    pub fn declared_file_inputs(&self) -> Vec<FileArtifact> {
        match &self.payload {
            PipPayload::Process(p) => p.inputs.clone(),
            PipPayload::WriteFile(_) | PipPayload::Meta => Vec::new(),
            PipPayload::CopyFile(p) => vec![p.source],
            PipPayload::SealDirectory(p) => p.contents.clone(),
            PipPayload::Ipc(p) => p.inputs.clone(),
        }
    }
}

/// Where a pip is in its lifecycle.
///
/// Transitions only move forward (Ready → Queued → Running → terminal),
/// with Canceled as the exception reachable from any non-terminal state.
/// The dispatcher gates every transition.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum PipState {
    Ready,
    Queued(DispatcherKind),
    Running(DispatcherKind),
    /// Finished from cache; outputs were materialized, nothing executed.
    Cached,
    /// Finished by executing.
    Executed,
    /// Never ran because an upstream dependency failed.
    Skipped,
    Failed,
    Canceled,
}

impl PipState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipState::Cached
                | PipState::Executed
                | PipState::Skipped
                | PipState::Failed
                | PipState::Canceled
        )
    }

    /// Terminal and produced its outputs.
    pub fn is_successful(&self) -> bool {
        matches!(self, PipState::Cached | PipState::Executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn semi_stable_hash_renders_fixed_width() {
        pretty_assert_eq!(SemiStableHash(0xBEEF).to_string(), "Pip000000000000BEEF");
    }

    #[test]
    fn seal_kind_classification() {
        assert!(SealKind::SharedOpaque.is_opaque());
        assert!(SealKind::ExclusiveOpaque.is_opaque());
        assert!(!SealKind::Full.is_opaque());
        assert!(SealKind::SourceTopDirectoryOnly.is_source());
        assert!(!SealKind::SharedOpaque.is_source());
    }

    #[test]
    fn terminal_states() {
        assert!(PipState::Cached.is_terminal());
        assert!(PipState::Failed.is_terminal());
        assert!(!PipState::Ready.is_terminal());
        assert!(!PipState::Queued(DispatcherKind::CacheLookup).is_terminal());
        assert!(PipState::Cached.is_successful());
        assert!(!PipState::Skipped.is_successful());
    }
}
