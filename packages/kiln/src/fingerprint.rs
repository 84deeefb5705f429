//! Weak and strong fingerprints.
//!
//! The two-phase cache is keyed by fingerprints computed here. The *weak*
//! fingerprint covers everything declared statically about a pip; the
//! *strong* fingerprint additionally covers what the pip actually observed
//! (its path set) and the content it observed there. This module is pure:
//! it never touches the filesystem or the network, and the same inputs
//! produce the same fingerprints on every machine, in every run, across
//! process restarts. Callers supply all content hashes.

use std::{collections::BTreeMap, path::PathBuf};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use wire::ContentHash;

use crate::{
    paths::{PathId, PathTable},
    pip::{EnvSpec, Pip, PipPayload},
    translate::DirectoryTranslator,
};

/// Hash of a pip's static declaration.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("wf:{_0}")]
pub struct WeakFingerprint(pub ContentHash);

/// Hash of (weak fingerprint, canonical path set, observed content hashes).
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("sf:{_0}")]
pub struct StrongFingerprint(pub ContentHash);

/// Build-wide salt mixed into every weak fingerprint.
///
/// Changing either field invalidates every cache entry, which is the
/// intended mechanism for fingerprint format changes and observation
/// reclassification rollouts.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FingerprintSalt {
    pub salt: String,
    /// Hash of the rules that reclassify observations (e.g. directory
    /// enumerations downgraded to existence probes under configured roots).
    pub reclassification_rules_hash: ContentHash,
}

impl FingerprintSalt {
    pub fn new(salt: impl Into<String>) -> Self {
        Self {
            salt: salt.into(),
            reclassification_rules_hash: ContentHash::from_buffer(b""),
        }
    }
}

/// The kind of a single filesystem observation.
///
/// The derived order (by variant, then payload) is the canonical order used
/// when two observations share a path.
#[derive(
    Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub enum ObservationKind {
    /// The file was read; its content hash participates in the strong
    /// fingerprint.
    FileContent,
    /// Existence was probed and the path existed.
    ExistenceProbe,
    /// The directory was enumerated; the membership fingerprint covers the
    /// sorted member names and their attribute bits.
    DirectoryEnumeration { membership: ContentHash },
    /// Existence was probed and the path did not exist.
    AbsentPathProbe,
}

/// One canonicalized filesystem observation.
///
/// Paths are stored as translated canonical strings, not [`PathId`]s,
/// because path sets outlive the build (and the machine) that produced
/// them.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub path: String,
    pub kind: ObservationKind,
}

/// The canonicalized, ordered set of paths a pip observed during execution.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct PathSet {
    observations: Vec<Observation>,
}

impl PathSet {
    /// The observations in canonical order.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// The canonical byte encoding, which is what gets hashed and stored.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        rmp_serde::to_vec(&self.observations).expect("path set serialization cannot fail")
    }

    /// Parse a path set from its canonical byte encoding.
    pub fn from_canonical_bytes(bytes: &[u8]) -> color_eyre::Result<Self> {
        use color_eyre::eyre::Context;
        let observations: Vec<Observation> =
            rmp_serde::from_slice(bytes).context("decode path set")?;
        Ok(Self { observations })
    }

    /// The content-addressed identity of this path set.
    pub fn id(&self) -> ContentHash {
        ContentHash::from_buffer(self.canonical_bytes())
    }
}

/// Scope filters applied during canonicalization: observations under any of
/// these prefixes are dropped before hashing (untracked mounts, scratch
/// scopes).
#[derive(Clone, Debug, Default)]
pub struct ScopeFilter {
    excluded_prefixes: Vec<PathBuf>,
}

impl ScopeFilter {
    pub fn new(excluded_prefixes: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            excluded_prefixes: excluded_prefixes.into_iter().collect(),
        }
    }

    fn excludes(&self, path: &std::path::Path) -> bool {
        self.excluded_prefixes.iter().any(|p| path.starts_with(p))
    }
}

/// Canonicalize raw observations: translate, filter, sort, and deduplicate.
///
/// When the same path carries multiple observation kinds, all survive; a
/// content read and an enumeration of the same path are distinct facts.
/// Exact duplicates collapse.
pub fn canonicalize_path_set(
    observed: impl IntoIterator<Item = (PathBuf, ObservationKind)>,
    translator: &DirectoryTranslator,
    filter: &ScopeFilter,
) -> PathSet {
    let mut observations: Vec<Observation> = observed
        .into_iter()
        .map(|(path, kind)| (translator.translate(&path), kind))
        .filter(|(path, _)| !filter.excludes(path))
        .map(|(path, kind)| Observation {
            path: path.to_string_lossy().into_owned(),
            kind,
        })
        .collect();

    observations.sort();
    observations.dedup();
    PathSet { observations }
}

/// The membership fingerprint of an enumerated directory: a hash over the
/// sorted member names and their attribute bits.
pub fn membership_fingerprint(members: &[(String, bool)]) -> ContentHash {
    let mut sorted = members.to_vec();
    sorted.sort();
    ContentHash::from_fields(sorted.iter().map(|(name, is_dir)| {
        let mut field = Vec::with_capacity(name.len() + 1);
        field.push(u8::from(*is_dir));
        field.extend_from_slice(name.as_bytes());
        field
    }))
}

/// The distinguished marker hashed for a tracked environment variable that
/// is declared but unset. No real value collides with it because values are
/// hashed with a `=` separator and this marker contains none.
const UNSET_MARKER: &str = "\u{0}unset\u{0}";

/// Compute the weak fingerprint of a pip from its static declaration.
///
/// Covered: tool identity, command line, environment (tracked values,
/// passthrough names), declared input hashes, declared outputs, tags, and
/// the build salt. Declared input and output lists are hashed in sorted
/// order so that declaration order does not affect the fingerprint.
pub fn weak_fingerprint_of(
    pip: &Pip,
    paths: &PathTable,
    declared_input_hashes: &BTreeMap<PathId, ContentHash>,
    salt: &FingerprintSalt,
) -> WeakFingerprint {
    let mut fields: Vec<Vec<u8>> = Vec::new();
    fields.push(salt.salt.clone().into_bytes());
    fields.push(salt.reclassification_rules_hash.to_string().into_bytes());
    fields.push(pip.kind().to_string().into_bytes());

    match &pip.payload {
        PipPayload::Process(process) => {
            fields.push(paths.resolve_lossy(process.executable).into_bytes());
            fields.push(paths.resolve_lossy(process.working_dir).into_bytes());
            for argument in &process.arguments {
                fields.push(format!("arg:{argument}").into_bytes());
            }
            // BTreeMap iteration is already sorted by name.
            for (name, spec) in &process.env {
                match spec {
                    EnvSpec::Tracked(Some(value)) => {
                        fields.push(format!("env:{name}={value}").into_bytes());
                    }
                    EnvSpec::Tracked(None) => {
                        fields.push(format!("env:{name}={UNSET_MARKER}").into_bytes());
                    }
                    EnvSpec::Passthrough => {
                        fields.push(format!("envpass:{name}").into_bytes());
                    }
                }
            }
        }
        PipPayload::WriteFile(write) => {
            fields.push(write.contents.clone().into_bytes());
        }
        PipPayload::CopyFile(_) | PipPayload::SealDirectory(_) | PipPayload::Meta => {}
        PipPayload::Ipc(ipc) => {
            fields.push(ipc.moniker.clone().into_bytes());
            fields.push(ipc.payload.clone().into_bytes());
        }
    }

    let mut inputs = pip
        .declared_file_inputs()
        .into_iter()
        .map(|artifact| {
            let rendered = paths.resolve_lossy(artifact.path);
            let hash = declared_input_hashes
                .get(&artifact.path)
                .map(ContentHash::to_string)
                .unwrap_or_else(|| UNSET_MARKER.to_string());
            format!("input:{rendered}#{}:{hash}", artifact.rewrite_count)
        })
        .collect::<Vec<_>>();
    inputs.sort();
    fields.extend(inputs.into_iter().map(String::into_bytes));

    let mut outputs = pip
        .declared_file_outputs()
        .into_iter()
        .map(|artifact| {
            format!(
                "output:{}#{}",
                paths.resolve_lossy(artifact.path),
                artifact.rewrite_count
            )
        })
        .collect::<Vec<_>>();
    outputs.sort();
    fields.extend(outputs.into_iter().map(String::into_bytes));

    let mut tags = pip.tags.clone();
    tags.sort();
    for tag in tags {
        fields.push(format!("tag:{tag}").into_bytes());
    }

    WeakFingerprint(ContentHash::from_fields(fields))
}

/// Compute the strong fingerprint from the weak fingerprint, the canonical
/// path set, and the observed content hashes in path-set order.
///
/// `observed_hashes` entries are `None` for observations without content
/// (probes, absent paths); the absence is itself hashed so that "read file"
/// and "probed file" never collide.
pub fn strong_fingerprint(
    weak: &WeakFingerprint,
    path_set: &PathSet,
    observed_hashes: &[Option<ContentHash>],
) -> StrongFingerprint {
    let mut fields: Vec<Vec<u8>> = Vec::new();
    fields.push(weak.0.to_string().into_bytes());
    fields.push(path_set.canonical_bytes());
    for hash in observed_hashes {
        match hash {
            Some(hash) => fields.push(hash.to_string().into_bytes()),
            None => fields.push(UNSET_MARKER.as_bytes().to_vec()),
        }
    }
    StrongFingerprint(ContentHash::from_fields(fields))
}
