//! First-failure reporting across the build pipeline.

use pairofcleats_adapters::stages::{CHUNK_META_ARTIFACT, POSTINGS_ARTIFACT};
use pairofcleats_adapters::{FaultPlan, InMemoryIndexStages};
use pairofcleats_app::{IndexBuildDeps, IndexBuildInput, IndexBuildOutput, run_index_build};
use pairofcleats_domain::{BuildStatus, IndexMode, SourceFile};
use pairofcleats_ports::RelationsRequest;
use pairofcleats_scheduler::{BuildScheduler, BuildSchedulerOptions, TokenTotals};
use pairofcleats_shared::{ErrorEnvelope, RequestContext};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

type TestResult = Result<(), Box<dyn Error>>;

fn corpus() -> Vec<SourceFile> {
    vec![
        SourceFile::new("src/main.rs", "use crate::net;\nfn main() {\n    net::serve();\n}\n"),
        SourceFile::new("src/net.rs", "pub fn serve() {}\n"),
        SourceFile::new("src/codec.rs", "pub fn encode() {}\n\npub fn decode() {}\n"),
        SourceFile::new("README.md", "Serve and decode.\n"),
    ]
}

fn input(incremental: bool) -> IndexBuildInput {
    IndexBuildInput {
        files: corpus(),
        mode: IndexMode::Code,
        relations: RelationsRequest {
            cross_file_inference: true,
            import_graph: true,
        },
        incremental,
        ..IndexBuildInput::default()
    }
}

async fn build(faults: FaultPlan, incremental: bool) -> Result<IndexBuildOutput, ErrorEnvelope> {
    let scheduler = BuildScheduler::new(BuildSchedulerOptions {
        tokens: TokenTotals { cpu: 2, io: 2, mem: 1 },
        ..BuildSchedulerOptions::default()
    });
    let deps = IndexBuildDeps::new(scheduler, Arc::new(InMemoryIndexStages::with_faults(faults)));
    run_index_build(&RequestContext::new_request(), &deps, input(incremental)).await
}

#[tokio::test]
async fn failed_file_serializes_as_failed_status() -> TestResult {
    let output = build(FaultPlan::default().failing_file("src/net.rs"), false).await?;

    let value = serde_json::to_value(&output)?;
    assert_eq!(value["status"]["status"], "failed");
    assert_eq!(value["status"]["error"]["message"], "injected process_file failure for src/net.rs");
    assert!(value["digests"].as_object().is_some_and(serde_json::Map::is_empty));
    assert!(output.status.summary().contains("injected process_file failure"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn slow_file_does_not_hide_the_first_failure() -> TestResult {
    let faults = FaultPlan::default()
        .delaying_file("src/main.rs", Duration::from_millis(500))
        .failing_file("src/codec.rs");
    let output = build(faults, false).await?;

    match output.status {
        BuildStatus::Failed { error, .. } => {
            assert_eq!(error.metadata.get("target").map(String::as_str), Some("src/codec.rs"));
        },
        BuildStatus::Completed => return Err("expected a failed build".into()),
    }
    Ok(())
}

#[tokio::test]
async fn failed_write_keeps_other_artifacts() -> TestResult {
    let output = build(FaultPlan::default().failing_artifact(POSTINGS_ARTIFACT), false).await?;

    assert!(!output.is_completed());
    assert!(output.digests.contains_key(CHUNK_META_ARTIFACT));
    assert!(!output.digests.contains_key(POSTINGS_ARTIFACT));
    Ok(())
}

#[tokio::test]
async fn relations_failure_is_returned_as_error() {
    let faults = FaultPlan {
        fail_relations: true,
        ..FaultPlan::default()
    };
    let result = build(faults, false).await;
    assert!(result.is_err_and(|error| error.code.code() == "injected_fault"));
}

#[tokio::test]
async fn postings_failure_is_returned_as_error() {
    let faults = FaultPlan {
        fail_postings: true,
        ..FaultPlan::default()
    };
    let result = build(faults, false).await;
    assert!(result.is_err_and(|error| error.metadata.get("stage").is_some()));
}

#[tokio::test]
async fn prefetch_failure_surfaces_at_the_join_point() {
    let faults = FaultPlan {
        fail_vfs_rows: true,
        ..FaultPlan::default()
    };
    assert!(build(faults.clone(), false).await.is_ok_and(|output| output.is_completed()));
    assert!(build(faults, true).await.is_err());
}
