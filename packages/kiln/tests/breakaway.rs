//! Breakaway semantics: a child matching the configured pattern leaves the
//! sandbox unobserved; a non-matching child's stray write is a violation
//! that (in warning mode) makes the pip uncacheable.

mod common;

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use pretty_assertions::assert_eq as pretty_assert_eq;

use kiln::{
    config::{EngineConfig, SandboxConfig},
    error::ExitKind,
    graph::{PipGraph, PipGraphBuilder},
    paths::PathTable,
    pip::{PipPayload, ProcessPip},
    sandbox::{AccessEvent, breakaway::BreakawayMatcher},
};

use common::{FakeTool, TestCluster, run_build};

/// A pip whose tool spawns `/bin/sh -c 'echo hi > /tmp/out'`; the shell
/// subtree performs the only write.
fn spawning_graph(paths: &Arc<PathTable>) -> Arc<PipGraph> {
    let mut builder = PipGraphBuilder::new(paths.clone());
    builder.add_pip(
        PipPayload::Process(ProcessPip {
            executable: paths.intern("/usr/bin/tool").unwrap(),
            arguments: vec![],
            working_dir: paths.intern("/work").unwrap(),
            env: BTreeMap::new(),
            inputs: vec![],
            input_dirs: vec![],
            outputs: vec![],
            output_dirs: vec![],
            untracked_scopes: vec![],
            allowed_undeclared_scopes: vec![],
            disable_cache_lookup: false,
        }),
        0,
        1,
        vec![],
    );
    Arc::new(builder.build().unwrap())
}

fn spawning_tool() -> FakeTool {
    FakeTool::new().reporting(vec![
        AccessEvent::ProcessStart {
            pid: 1,
            parent: 0,
            executable: PathBuf::from("/usr/bin/tool"),
            arguments: vec![],
        },
        AccessEvent::ProcessStart {
            pid: 10,
            parent: 1,
            executable: PathBuf::from("/bin/sh"),
            arguments: vec!["-c".into(), "echo hi > /tmp/out".into()],
        },
        AccessEvent::Write {
            pid: 10,
            path: PathBuf::from("/tmp/out"),
        },
        AccessEvent::ProcessExit {
            pid: 10,
            exit_code: 0,
        },
        AccessEvent::ProcessExit {
            pid: 1,
            exit_code: 0,
        },
    ])
}

fn config(required_argument: &str) -> EngineConfig {
    EngineConfig::builder()
        .sandbox(
            SandboxConfig::builder()
                .breakaway(vec![
                    BreakawayMatcher::new("sh").with_required_arguments([required_argument]),
                ])
                .violations_are_warnings(true)
                .build(),
        )
        .build()
}

#[tokio::test]
async fn matching_breakaway_is_unobserved_and_cacheable() {
    let cluster = TestCluster::new();
    let machine = cluster.machine("m1", vec![]);
    let paths = Arc::new(PathTable::new());

    let (summary, _) = run_build(
        &cluster,
        &machine,
        spawning_graph(&paths),
        spawning_tool(),
        config("hi"),
    )
    .await;
    pretty_assert_eq!(summary.exit_kind, ExitKind::Success);
    pretty_assert_eq!(summary.executed, 1);

    // The pip was cacheable: a second build hits instead of re-running.
    let (summary, _) = run_build(
        &cluster,
        &machine,
        spawning_graph(&paths),
        spawning_tool(),
        config("hi"),
    )
    .await;
    pretty_assert_eq!(summary.cache_hits, 1);
    pretty_assert_eq!(summary.executed, 0);
}

#[tokio::test]
async fn non_matching_breakaway_warns_and_is_uncacheable() {
    let cluster = TestCluster::new();
    let machine = cluster.machine("m1", vec![]);
    let paths = Arc::new(PathTable::new());

    // The matcher requires "bye"; the shell's command line says "hi", so
    // the subtree stays observed and its write is a (warned) violation.
    let (summary, _) = run_build(
        &cluster,
        &machine,
        spawning_graph(&paths),
        spawning_tool(),
        config("bye"),
    )
    .await;
    pretty_assert_eq!(summary.exit_kind, ExitKind::Success);
    pretty_assert_eq!(summary.executed, 1);

    // Uncacheable: nothing was published, so the next build re-executes.
    let (summary, _) = run_build(
        &cluster,
        &machine,
        spawning_graph(&paths),
        spawning_tool(),
        config("bye"),
    )
    .await;
    pretty_assert_eq!(summary.cache_hits, 0);
    pretty_assert_eq!(summary.executed, 1);
}
