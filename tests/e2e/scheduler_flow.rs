//! Index builds sharing one scheduler.

use pairofcleats_adapters::{InMemoryIndexStages, MemoryInFlightTelemetry};
use pairofcleats_app::{IndexBuildDeps, IndexBuildInput, IndexBuildOutput, run_index_build};
use pairofcleats_domain::{BuildStatus, IndexMode, SourceFile, channels, queues};
use pairofcleats_ports::RelationsRequest;
use pairofcleats_scheduler::{BuildScheduler, BuildSchedulerOptions, TokenTotals};
use pairofcleats_shared::{ErrorEnvelope, RequestContext, SCHEDULER_NAMESPACE};
use std::error::Error;
use std::sync::Arc;

type TestResult = Result<(), Box<dyn Error>>;

fn code_corpus(prefix: &str, files: usize) -> Vec<SourceFile> {
    (0..files)
        .map(|index| {
            let next = (index + 1) % files;
            SourceFile::new(
                format!("{prefix}/mod_{index}.rs"),
                format!(
                    "use crate::mod_{next};\n\npub fn item_{index}() -> usize {{\n    {index}\n}}\n"
                ),
            )
        })
        .collect()
}

fn input(files: Vec<SourceFile>) -> IndexBuildInput {
    IndexBuildInput {
        files,
        mode: IndexMode::Code,
        relations: RelationsRequest {
            cross_file_inference: true,
            import_graph: true,
        },
        incremental: true,
        ..IndexBuildInput::default()
    }
}

fn scheduler(cpu: u32, io: u32) -> BuildScheduler {
    BuildScheduler::new(BuildSchedulerOptions {
        tokens: TokenTotals { cpu, io, mem: 1 },
        ..BuildSchedulerOptions::default()
    })
}

async fn build_alone(files: Vec<SourceFile>) -> Result<IndexBuildOutput, ErrorEnvelope> {
    let deps = IndexBuildDeps::new(scheduler(1, 1), Arc::new(InMemoryIndexStages::new()));
    run_index_build(&RequestContext::new_request(), &deps, input(files)).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_builds_match_isolated_builds() -> TestResult {
    let shared = scheduler(3, 2);
    let left_deps = IndexBuildDeps::new(shared.clone(), Arc::new(InMemoryIndexStages::new()));
    let right_deps = IndexBuildDeps::new(shared.clone(), Arc::new(InMemoryIndexStages::new()));
    let left_ctx = RequestContext::new_request();
    let right_ctx = RequestContext::new_request();

    let (left, right) = tokio::join!(
        run_index_build(&left_ctx, &left_deps, input(code_corpus("left", 12))),
        run_index_build(&right_ctx, &right_deps, input(code_corpus("right", 9))),
    );
    let (left, right) = (left?, right?);

    assert!(left.is_completed());
    assert!(right.is_completed());
    assert_eq!(left.digests, build_alone(code_corpus("left", 12)).await?.digests);
    assert_eq!(right.digests, build_alone(code_corpus("right", 9)).await?.digests);

    let stats = shared.stats();
    assert_eq!(stats.counters.rejected, 0);
    assert_eq!(stats.counters.failed, 0);
    assert_eq!(stats.counters.started, stats.counters.completed);
    assert_eq!(stats.tokens.cpu.in_use, 0);
    assert_eq!(stats.tokens.io.in_use, 0);
    assert_eq!(stats.tokens.mem.in_use, 0);
    let file_queue = stats
        .queues
        .get(queues::STAGE1_CPU)
        .ok_or("file queue missing")?;
    assert_eq!(file_queue.completed, 21);
    Ok(())
}

#[tokio::test]
async fn write_channel_is_cleared_after_each_build() -> TestResult {
    let telemetry = Arc::new(MemoryInFlightTelemetry::new());
    let deps = IndexBuildDeps::new(scheduler(2, 1), Arc::new(InMemoryIndexStages::new()))
        .with_telemetry(telemetry.clone());

    for label in ["first", "second"] {
        let output =
            run_index_build(&RequestContext::new_request(), &deps, input(code_corpus(label, 4)))
                .await?;
        assert!(output.is_completed());
        assert!(telemetry.get(channels::ARTIFACTS_WRITE).is_none());
    }
    assert!(telemetry.peak_bytes(channels::ARTIFACTS_WRITE) > 0);
    Ok(())
}

#[tokio::test]
async fn shut_down_scheduler_fails_the_build() -> TestResult {
    let scheduler = scheduler(2, 1);
    scheduler.shutdown();
    let deps = IndexBuildDeps::new(scheduler, Arc::new(InMemoryIndexStages::new()));

    let output =
        run_index_build(&RequestContext::new_request(), &deps, input(code_corpus("down", 3)))
            .await?;

    match output.status {
        BuildStatus::Failed { error, .. } => {
            assert_eq!(error.code.namespace(), SCHEDULER_NAMESPACE);
            assert_eq!(error.code.code(), "shutdown");
        },
        BuildStatus::Completed => return Err("expected a failed build".into()),
    }
    assert!(output.digests.is_empty());
    Ok(())
}
