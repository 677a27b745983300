//! Stage 1: process files on `stage1.cpu`, flushed in index order.

use super::types::{FileStageStats, IndexBuildDeps, IndexBuildInput};
use pairofcleats_domain::{ProcessedFile, SourceFile, queues};
use pairofcleats_ports::log_fields;
use pairofcleats_scheduler::{
    CompletionTracker, FirstFailure, OrderedAppender, OrderedAppenderOptions, ScheduleRequest,
    TokenRequest, WaitOptions,
};
use pairofcleats_shared::{RequestContext, Result};
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Files at or just past the next expected index never wait for buffer space.
const BYPASS_WINDOW: usize = 1;

/// Outcome of the file stage.
pub(super) enum FilesOutcome {
    Processed(Vec<ProcessedFile>),
    Failed(FirstFailure),
}

pub(super) async fn process_files(
    ctx: &RequestContext,
    deps: &IndexBuildDeps,
    input: &IndexBuildInput,
    stats: &mut FileStageStats,
) -> Result<FilesOutcome> {
    let started = Instant::now();
    let processed = Arc::new(Mutex::new(Vec::with_capacity(input.files.len())));
    let sink = Arc::clone(&processed);
    let appender = OrderedAppender::new(
        OrderedAppenderOptions {
            start_index: 0,
            max_pending_before_backpressure: input.max_buffered_files,
        },
        move |_, file: ProcessedFile| {
            sink.lock().unwrap_or_else(PoisonError::into_inner).push(file);
            Ok(())
        },
    );
    let tracker = CompletionTracker::new();

    for (index, file) in input.files.iter().cloned().enumerate() {
        ctx.ensure_not_cancelled("run_index_build.process_file")?;
        appender.wait_for_capacity(index, BYPASS_WINDOW).await?;
        let _handle = tracker.track(process_one(ctx, deps, &appender, index, file));
    }

    let options = wait_options(ctx, deps, input, "Processing files");
    let drained = tracker.wait(options).await;
    stats.files = u64::try_from(input.files.len()).unwrap_or(u64::MAX);
    stats.failed = u64::try_from(tracker.snapshot().failed).unwrap_or(u64::MAX);
    stats.duration_ms = elapsed_ms(started);

    if let Err(error) = drained {
        return match tracker.first_failure() {
            Some(first) if first.error == error => Ok(FilesOutcome::Failed(first)),
            _ => Err(error),
        };
    }

    let files = std::mem::take(&mut *processed.lock().unwrap_or_else(PoisonError::into_inner));
    stats.chunks = files
        .iter()
        .map(|file| u64::try_from(file.chunks.len()).unwrap_or(u64::MAX))
        .sum();
    Ok(FilesOutcome::Processed(files))
}

fn process_one(
    ctx: &RequestContext,
    deps: &IndexBuildDeps,
    appender: &OrderedAppender<ProcessedFile>,
    index: usize,
    file: SourceFile,
) -> impl Future<Output = Result<()>> + Send + 'static {
    let ctx = ctx.clone();
    let scheduler = deps.scheduler.clone();
    let stages = Arc::clone(&deps.stages);
    let appender = appender.clone();
    let request = ScheduleRequest::new(TokenRequest::cpu(1)).with_bytes(file.byte_len());
    async move {
        let result = scheduler
            .schedule(queues::STAGE1_CPU, request, || {
                stages.process_file(&ctx, index, file)
            })
            .await;
        match result {
            Ok(processed) => appender.enqueue(index, processed).await,
            Err(error) => {
                drop(appender.skip(index));
                Err(error)
            },
        }
    }
}

/// Drain options with the configured poll and deadline, bound to `ctx`.
pub(super) fn wait_options(
    ctx: &RequestContext,
    deps: &IndexBuildDeps,
    input: &IndexBuildInput,
    label: &'static str,
) -> WaitOptions {
    let logger = Arc::clone(&deps.logger);
    WaitOptions::from_millis(input.completion.stall_poll_ms, input.completion.timeout_ms)
        .with_cancellation(ctx.cancellation_token())
        .with_stall_callback(move |report| {
            logger.warn(
                "status.stall",
                &format!("{label}: waiting on {} pending", report.pending),
                Some(log_fields([
                    ("pending", json!(report.pending)),
                    ("failed", json!(report.failed)),
                    ("stallCount", json!(report.stall_count)),
                    ("elapsedMs", json!(report.elapsed_ms)),
                ])),
            );
        })
}

pub(super) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
