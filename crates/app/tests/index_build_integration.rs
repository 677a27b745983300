//! Integration tests for the index build pipeline.

use pairofcleats_adapters::stages::{
    BUNDLE_INDEX_ARTIFACT, FILE_META_ARTIFACT, RELATIONS_ARTIFACT, VFS_MANIFEST_ARTIFACT,
};
use pairofcleats_adapters::{
    FaultPlan, InMemoryIndexStages, JsonLogger, MemoryInFlightTelemetry, MemoryLogSink,
};
use pairofcleats_app::{
    IndexBuildDeps, IndexBuildInput, IndexBuildOutput, OverlapSettings, run_index_build,
};
use pairofcleats_domain::{
    BuildStatus, IndexMode, OverlapResolution, SourceFile, channels, queues,
};
use pairofcleats_ports::RelationsRequest;
use pairofcleats_scheduler::{BuildScheduler, BuildSchedulerOptions, TokenTotals};
use pairofcleats_shared::{ErrorCode, RequestContext};
use serde_json::Value;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

type TestResult = Result<(), Box<dyn Error>>;

fn corpus() -> Vec<SourceFile> {
    vec![
        SourceFile::new("src/a.rs", "use b;\nuse c;\n\nfn alpha() {\n    b::beta();\n}\n"),
        SourceFile::new("src/b.rs", "use c;\n\npub fn beta() {\n    c::gamma();\n}\n"),
        SourceFile::new("src/c.rs", "pub fn gamma() {}\n\npub fn delta() {}\n"),
        SourceFile::new("docs/readme.md", "Alpha beta gamma.\n\nDelta.\n"),
    ]
}

fn scheduler() -> BuildScheduler {
    BuildScheduler::new(BuildSchedulerOptions {
        tokens: TokenTotals { cpu: 2, io: 1, mem: 1 },
        ..BuildSchedulerOptions::default()
    })
}

fn input() -> IndexBuildInput {
    IndexBuildInput {
        files: corpus(),
        mode: IndexMode::Code,
        relations: RelationsRequest {
            cross_file_inference: true,
            import_graph: true,
        },
        incremental: true,
        ..IndexBuildInput::default()
    }
}

async fn build(
    stages: InMemoryIndexStages,
    input: IndexBuildInput,
) -> pairofcleats_shared::Result<IndexBuildOutput> {
    let deps = IndexBuildDeps::new(scheduler(), Arc::new(stages));
    run_index_build(&RequestContext::new_request(), &deps, input).await
}

#[tokio::test]
async fn overlap_does_not_change_artifact_bytes() -> TestResult {
    let overlapped = build(InMemoryIndexStages::new(), input()).await?;
    let sequential = build(
        InMemoryIndexStages::new(),
        IndexBuildInput {
            overlap: OverlapSettings {
                enabled: false,
                infer_postings: true,
            },
            ..input()
        },
    )
    .await?;

    assert!(overlapped.is_completed());
    assert!(sequential.is_completed());
    assert_eq!(overlapped.overlap.postings, OverlapResolution::Joined);
    assert_eq!(sequential.overlap.postings, OverlapResolution::NotStarted);
    assert_eq!(overlapped.digests, sequential.digests);
    assert_eq!(overlapped.combined_digest, sequential.combined_digest);
    assert_eq!(overlapped.artifacts.len(), 7);
    Ok(())
}

#[tokio::test]
async fn prefetched_vfs_rows_match_rows_computed_late() -> TestResult {
    let prefetched = build(InMemoryIndexStages::new(), input()).await?;
    let import_only = build(
        InMemoryIndexStages::new(),
        IndexBuildInput {
            relations: RelationsRequest {
                cross_file_inference: false,
                import_graph: true,
            },
            ..input()
        },
    )
    .await?;

    assert_eq!(prefetched.overlap.vfs_prefetch, OverlapResolution::Joined);
    assert_eq!(import_only.overlap.vfs_prefetch, OverlapResolution::NotStarted);
    for name in [VFS_MANIFEST_ARTIFACT, BUNDLE_INDEX_ARTIFACT] {
        assert_eq!(
            prefetched.artifacts.get(name),
            import_only.artifacts.get(name),
            "{name} differs"
        );
    }
    assert_ne!(
        prefetched.artifacts.get(RELATIONS_ARTIFACT),
        import_only.artifacts.get(RELATIONS_ARTIFACT)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn out_of_order_completion_keeps_file_order() -> TestResult {
    let baseline = build(InMemoryIndexStages::new(), input()).await?;
    let delayed = InMemoryIndexStages::with_faults(
        FaultPlan::default()
            .delaying_file("src/a.rs", Duration::from_millis(40))
            .delaying_file("src/b.rs", Duration::from_millis(10)),
    );
    let reordered = build(
        delayed,
        IndexBuildInput {
            max_buffered_files: Some(1),
            ..input()
        },
    )
    .await?;

    assert_eq!(
        baseline.artifacts.get(FILE_META_ARTIFACT),
        reordered.artifacts.get(FILE_META_ARTIFACT)
    );
    assert_eq!(baseline.combined_digest, reordered.combined_digest);
    assert_eq!(reordered.stage_stats.files.files, 4);
    Ok(())
}

#[tokio::test]
async fn failing_file_reports_first_failure_and_writes_nothing() -> TestResult {
    let stages = InMemoryIndexStages::with_faults(FaultPlan::default().failing_file("src/b.rs"));
    let output = build(stages.clone(), input()).await?;

    let BuildStatus::Failed { error, .. } = &output.status else {
        return Err("expected a failed build".into());
    };
    assert_eq!(error.code, ErrorCode::new("stages", "injected_fault"));
    assert!(error.message.contains("src/b.rs"));
    assert!(output.status.summary().starts_with("failed: injected process_file failure"));
    assert_eq!(output.stage_stats.files.failed, 1);
    assert!(stages.written().is_empty());
    assert!(output.artifacts.is_empty());
    assert_eq!(output.scheduler.queues.get(queues::STAGE1_CPU).map(|q| q.failed), Some(1));
    Ok(())
}

#[tokio::test]
async fn failing_write_keeps_the_other_artifacts() -> TestResult {
    let stages =
        InMemoryIndexStages::with_faults(FaultPlan::default().failing_artifact(RELATIONS_ARTIFACT));
    let output = build(stages.clone(), input()).await?;

    assert!(!output.is_completed());
    assert_eq!(output.artifacts.len(), 4);
    assert!(output.artifacts.get(RELATIONS_ARTIFACT).is_none());
    assert_eq!(stages.written(), output.artifacts);
    assert!(output.digests.get(VFS_MANIFEST_ARTIFACT).is_none());
    Ok(())
}

#[tokio::test]
async fn prose_mode_skips_overlap() -> TestResult {
    let output = build(
        InMemoryIndexStages::new(),
        IndexBuildInput {
            mode: IndexMode::Prose,
            relations: RelationsRequest::default(),
            incremental: false,
            ..input()
        },
    )
    .await?;

    assert!(output.is_completed());
    assert_eq!(output.overlap.postings, OverlapResolution::NotStarted);
    assert_eq!(output.overlap.vfs_prefetch, OverlapResolution::NotStarted);
    assert!(!output.stage_stats.relations.ran);
    assert_eq!(output.artifacts.len(), 5);
    assert!(output.stage_stats.postings.terms > 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_context_stops_before_any_stage() -> TestResult {
    let stages = InMemoryIndexStages::new();
    let deps = IndexBuildDeps::new(scheduler(), Arc::new(stages.clone()));
    let ctx = RequestContext::new_request();
    ctx.cancel();

    let error = run_index_build(&ctx, &deps, input())
        .await
        .err()
        .ok_or("expected cancellation")?;
    assert_eq!(error.code, ErrorCode::cancelled());
    assert!(stages.written().is_empty());
    Ok(())
}

#[tokio::test]
async fn writes_publish_progress_and_in_flight_bytes() -> TestResult {
    let sink = Arc::new(MemoryLogSink::default());
    let telemetry = Arc::new(MemoryInFlightTelemetry::new());
    let deps = IndexBuildDeps::new(scheduler(), Arc::new(InMemoryIndexStages::new()))
        .with_logger(Arc::new(JsonLogger::new(sink.clone())))
        .with_telemetry(telemetry.clone());
    let output = run_index_build(
        &RequestContext::new_request(),
        &deps,
        IndexBuildInput {
            incremental: false,
            ..input()
        },
    )
    .await?;
    assert!(output.is_completed());

    let messages: Vec<String> = sink
        .lines()
        .iter()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|event| event.get("event").and_then(Value::as_str) == Some("status.line"))
        .filter_map(|event| event.get("message").and_then(Value::as_str).map(str::to_owned))
        .collect();
    assert!(messages.first().is_some_and(|line| line.starts_with("Writing index files 1/5 (20.0%) | ")));
    assert!(messages.last().is_some_and(|line| line.starts_with("Writing index files 5/5 (100.0%) | ")));

    assert!(telemetry.peak_bytes(channels::ARTIFACTS_WRITE) > 0);
    assert!(telemetry.get(channels::ARTIFACTS_WRITE).is_none());
    assert_eq!(output.stage_stats.write.artifacts, 5);
    assert_eq!(output.stage_stats.write.bytes, output.artifacts.total_bytes());
    Ok(())
}
