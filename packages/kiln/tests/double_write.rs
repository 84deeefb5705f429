//! Double-write detection: two pips producing the same output fail the
//! build — both producers, whether the collision is declared up front or
//! only observed at execution time — and dependents are skipped.

mod common;

use std::{collections::BTreeMap, sync::Arc};

use pretty_assertions::assert_eq as pretty_assert_eq;

use kiln::{
    config::{EngineConfig, SandboxConfig},
    error::ExitKind,
    fs,
    graph::PipGraphBuilder,
    paths::PathTable,
    pip::{
        CopyFilePip, DirectoryArtifact, FileArtifact, PipPayload, ProcessPip, SealKind,
        WriteFilePip,
    },
    sandbox::{AccessEvent, opaque::MarkPolicy},
};

use common::{FakeTool, TestCluster, run_build};

#[tokio::test]
async fn declared_double_write_fails_both_producers_and_skips_dependents() {
    let cluster = TestCluster::new();
    let machine = cluster.machine("m1", vec![]);
    let paths = Arc::new(PathTable::new());
    let target = cluster.path("out/a.txt");

    let mut builder = PipGraphBuilder::new(paths.clone());
    let first = builder.add_pip(
        PipPayload::WriteFile(WriteFilePip {
            destination: FileArtifact::output(paths.intern(&target).unwrap()),
            contents: "from first".into(),
        }),
        0,
        1,
        vec![],
    );
    let second = builder.add_pip(
        PipPayload::WriteFile(WriteFilePip {
            destination: FileArtifact::output(paths.intern(&target).unwrap()),
            contents: "from second".into(),
        }),
        0,
        1,
        vec![],
    );
    let dependent = builder.add_pip(
        PipPayload::CopyFile(CopyFilePip {
            source: FileArtifact::output(paths.intern(&target).unwrap()),
            destination: FileArtifact::output(paths.intern(cluster.path("out/b.txt")).unwrap()),
        }),
        0,
        1,
        vec![],
    );
    let graph = Arc::new(builder.build().unwrap());
    assert_ne!(first, second);
    assert_ne!(second, dependent);

    let (summary, _) = run_build(
        &cluster,
        &machine,
        graph,
        FakeTool::new(),
        EngineConfig::default(),
    )
    .await;

    pretty_assert_eq!(summary.exit_kind, ExitKind::UserError);
    pretty_assert_eq!(summary.failed, 2);
    pretty_assert_eq!(summary.skipped, 1);
    pretty_assert_eq!(summary.executed, 0);
    pretty_assert_eq!(summary.cache_hits, 0);
    pretty_assert_eq!(
        summary
            .failure_codes
            .get("InvalidOutputDueToSimpleDoubleWrite"),
        Some(&2)
    );

    // Neither producer ran: the contested output was never written.
    assert!(!fs::exists(&target).await);
    assert!(!fs::exists(&cluster.path("out/b.txt")).await);
}

#[tokio::test]
async fn dynamic_double_write_fails_both_producers() {
    let cluster = TestCluster::new();
    let machine = cluster.machine("m1", vec![]);
    let paths = Arc::new(PathTable::new());

    // Two process pips share a shared-opaque output directory and neither
    // declares a file output, so the collision is only observable at
    // execution time, when both write the same path into it.
    let so_root = cluster.path("so");
    let contested = so_root.join("a.txt");
    let mut builder = PipGraphBuilder::new(paths.clone());
    let mut add_producer = |argument: &str, seal_id: u32| {
        builder.add_pip(
            PipPayload::Process(ProcessPip {
                executable: paths.intern("/usr/bin/tool").unwrap(),
                arguments: vec![argument.into()],
                working_dir: paths.intern(cluster.path("ws")).unwrap(),
                env: BTreeMap::new(),
                inputs: vec![],
                input_dirs: vec![],
                outputs: vec![],
                output_dirs: vec![DirectoryArtifact {
                    path: paths.intern(&so_root).unwrap(),
                    seal_id,
                    kind: SealKind::SharedOpaque,
                }],
                untracked_scopes: vec![],
                allowed_undeclared_scopes: vec![],
                disable_cache_lookup: false,
            }),
            0,
            1,
            vec![],
        )
    };
    let first = add_producer("one", 0);
    let second = add_producer("two", 1);
    assert_ne!(first, second);
    let graph = Arc::new(builder.build().unwrap());
    assert!(graph.declared_double_writes().is_empty());

    let tool = FakeTool::new()
        .writing(&contested, b"X".to_vec())
        .reporting(vec![AccessEvent::Write {
            pid: 1,
            path: contested.clone(),
        }]);
    let config = EngineConfig::builder()
        .sandbox(
            SandboxConfig::builder()
                .mark_policy(MarkPolicy::Timestamp)
                .build(),
        )
        .build();
    let (summary, _) = run_build(&cluster, &machine, graph, tool, config).await;

    // Both producers fail: the later claimant directly, the earlier one by
    // revocation, even though it had already finished.
    pretty_assert_eq!(summary.exit_kind, ExitKind::UserError);
    pretty_assert_eq!(summary.failed, 2);
    pretty_assert_eq!(summary.executed, 0);
    pretty_assert_eq!(summary.cache_hits, 0);
    pretty_assert_eq!(
        summary
            .failure_codes
            .get("InvalidOutputDueToSimpleDoubleWrite"),
        Some(&2)
    );
}
