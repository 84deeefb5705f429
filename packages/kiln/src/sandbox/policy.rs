//! Access policy evaluation.
//!
//! Turns the raw event stream of one observed execution into:
//! - the pip's raw observations (later canonicalized into its path set),
//! - the set of paths it wrote,
//! - the content hashes the monitor reported while reads flowed through,
//! - and its access violations.
//!
//! Policy: writes outside declared output roots are violations; reads from
//! unknown sources (not a declared input, not inside an allow-listed scope,
//! not a well-known system path) are violations. Violations surface as
//! warnings or errors per configuration; a pip that completes with warned
//! violations becomes uncacheable.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use strum::Display as StrumDisplay;
use tracing::{instrument, trace};
use wire::ContentHash;

use crate::{
    fingerprint::{ObservationKind, membership_fingerprint},
    sandbox::{AccessEvent, ObservedExecution, ProcessSpec, breakaway::BreakawayMatcher},
};

/// Scopes every process may read without declaring: the toolchains and
/// system surface shared by everything on the machine.
pub const WELL_KNOWN_SCOPES: &[&str] = &[
    "/bin", "/dev", "/etc", "/lib", "/lib64", "/opt", "/proc", "/sbin", "/sys", "/usr",
];

/// What a process did that its declaration does not permit.
#[derive(Copy, Clone, Eq, PartialEq, Debug, StrumDisplay)]
pub enum ViolationKind {
    UndeclaredWrite,
    DisallowedRead,
}

/// One access violation.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Violation {
    pub kind: ViolationKind,
    pub path: PathBuf,
    pub pid: u32,
}

/// The outcome of policy evaluation over one execution.
#[derive(Clone, Debug, Default)]
pub struct PolicyVerdict {
    /// Raw observations, pre-canonicalization.
    pub observations: Vec<(PathBuf, ObservationKind)>,
    /// Content hashes the monitor reported for observed reads.
    pub observed_hashes: BTreeMap<PathBuf, ContentHash>,
    /// Paths written inside declared output roots.
    pub written_paths: Vec<PathBuf>,
    pub violations: Vec<Violation>,
    /// Whether violations are downgraded to warnings by configuration.
    pub violations_are_warnings: bool,
    /// Pids whose subtrees broke away and were not observed.
    pub breakaway_pids: BTreeSet<u32>,
}

impl PolicyVerdict {
    /// Violations in warning mode leave the pip runnable but forbid
    /// publishing its results.
    pub fn is_uncacheable(&self) -> bool {
        self.violations_are_warnings && !self.violations.is_empty()
    }

    /// Violations in error mode fail the pip.
    pub fn has_blocking_violations(&self) -> bool {
        !self.violations_are_warnings && !self.violations.is_empty()
    }
}

/// Evaluate the access policy over an observed execution.
#[instrument(skip_all, fields(events = observed.events.len()))]
pub fn evaluate(
    spec: &ProcessSpec,
    observed: &ObservedExecution,
    breakaway: &[BreakawayMatcher],
    violations_are_warnings: bool,
) -> PolicyVerdict {
    let mut verdict = PolicyVerdict {
        violations_are_warnings,
        ..PolicyVerdict::default()
    };
    let mut written: BTreeSet<PathBuf> = BTreeSet::new();

    for event in &observed.events {
        // Membership in a breakaway subtree is decided at ProcessStart, and
        // events arrive in observation order, so a child's accesses always
        // follow its start event.
        if let AccessEvent::ProcessStart {
            pid,
            parent,
            executable,
            arguments,
        } = event
        {
            let inherited = verdict.breakaway_pids.contains(parent);
            let matched = breakaway
                .iter()
                .any(|matcher| matcher.matches(executable, arguments));
            if inherited || matched {
                trace!(pid, ?executable, inherited, "process broke away");
                verdict.breakaway_pids.insert(*pid);
            }
            continue;
        }

        if verdict.breakaway_pids.contains(&event.pid()) {
            continue;
        }

        match event {
            AccessEvent::Read { pid, path, hash } => {
                if in_scope(path, &spec.untracked_scopes) {
                    continue;
                }
                verdict
                    .observations
                    .push((path.clone(), ObservationKind::FileContent));
                if let Some(hash) = hash {
                    verdict.observed_hashes.insert(path.clone(), *hash);
                }
                if !read_is_allowed(path, spec) {
                    verdict.violations.push(Violation {
                        kind: ViolationKind::DisallowedRead,
                        path: path.clone(),
                        pid: *pid,
                    });
                }
            }
            AccessEvent::Probe { path, existed, .. } => {
                if in_scope(path, &spec.untracked_scopes) {
                    continue;
                }
                let kind = if *existed {
                    ObservationKind::ExistenceProbe
                } else {
                    ObservationKind::AbsentPathProbe
                };
                verdict.observations.push((path.clone(), kind));
            }
            AccessEvent::Write { pid, path } => {
                if in_scope(path, &spec.untracked_scopes) {
                    continue;
                }
                if in_scope(path, &spec.output_roots) {
                    if written.insert(path.clone()) {
                        verdict.written_paths.push(path.clone());
                    }
                } else {
                    verdict.violations.push(Violation {
                        kind: ViolationKind::UndeclaredWrite,
                        path: path.clone(),
                        pid: *pid,
                    });
                }
            }
            AccessEvent::Enumerate { path, members, .. } => {
                if in_scope(path, &spec.untracked_scopes) {
                    continue;
                }
                verdict.observations.push((
                    path.clone(),
                    ObservationKind::DirectoryEnumeration {
                        membership: membership_fingerprint(members),
                    },
                ));
            }
            AccessEvent::ProcessStart { .. } | AccessEvent::ProcessExit { .. } => {}
        }
    }

    verdict
}

fn in_scope(path: &Path, scopes: &[PathBuf]) -> bool {
    scopes.iter().any(|scope| path.starts_with(scope))
}

fn read_is_allowed(path: &Path, spec: &ProcessSpec) -> bool {
    if spec.declared_inputs.iter().any(|input| input == path) {
        return true;
    }
    if in_scope(path, &spec.allowed_scopes) {
        return true;
    }
    // A pip may read back what it is allowed to write.
    if in_scope(path, &spec.output_roots) {
        return true;
    }
    if path == spec.executable || path.starts_with(&spec.working_dir) {
        return true;
    }
    WELL_KNOWN_SCOPES
        .iter()
        .any(|scope| path.starts_with(scope))
}
