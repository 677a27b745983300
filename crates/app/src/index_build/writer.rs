//! Artifact writes on `stage2.write` with in-flight byte telemetry and
//! throttled progress lines.

use super::files::{elapsed_ms, wait_options};
use super::types::{IndexBuildDeps, IndexBuildInput, WriteStageStats};
use pairofcleats_domain::{ArtifactSet, channels, queues};
use pairofcleats_ports::PendingArtifact;
use pairofcleats_scheduler::{
    CompletionTracker, FirstFailure, PendingSnapshot, QueueTelemetry, ScheduleRequest,
    TokenRequest, WriteProgress, longest_in_flight_age,
};
use pairofcleats_shared::{RequestContext, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

#[derive(Debug, Default)]
struct InFlightState {
    active: BTreeMap<Box<str>, (Instant, u64)>,
    longest_stall_secs: u64,
}

/// Artifacts currently being written, published on `artifacts.write`.
#[derive(Debug)]
struct InFlightWrites {
    state: Mutex<InFlightState>,
    telemetry: QueueTelemetry,
}

impl InFlightWrites {
    fn new(telemetry: QueueTelemetry) -> Self {
        telemetry.sync_queue_state(channels::ARTIFACTS_WRITE, true);
        Self {
            state: Mutex::new(InFlightState::default()),
            telemetry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, InFlightState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, name: &str, bytes: u64) {
        let mut state = self.lock();
        state.active.insert(Box::from(name), (Instant::now(), bytes));
        self.publish(&state);
    }

    fn finish(&self, name: &str) {
        let mut state = self.lock();
        let age = longest_in_flight_age(
            state.active.values().map(|(started, _)| *started),
            Instant::now(),
        );
        state.longest_stall_secs = state.longest_stall_secs.max(age);
        state.active.remove(name);
        self.publish(&state);
    }

    fn publish(&self, state: &InFlightState) {
        let count = u64::try_from(state.active.len()).unwrap_or(u64::MAX);
        let bytes = state.active.values().map(|(_, bytes)| *bytes).sum();
        self.telemetry.emit_snapshot(
            channels::ARTIFACTS_WRITE,
            PendingSnapshot::from_counts(count, bytes),
        );
    }

    fn close(&self) -> u64 {
        self.telemetry
            .sync_queue_state(channels::ARTIFACTS_WRITE, false);
        self.lock().longest_stall_secs
    }
}

/// Shared state of one write batch.
struct WriteBatch {
    ctx: RequestContext,
    deps: IndexBuildDeps,
    in_flight: InFlightWrites,
    progress: WriteProgress,
    written: Mutex<ArtifactSet>,
}

/// Write `artifacts` concurrently; returns the first failure, if any.
pub(super) async fn write_artifacts(
    ctx: &RequestContext,
    deps: &IndexBuildDeps,
    input: &IndexBuildInput,
    artifacts: Vec<PendingArtifact>,
    written: &mut ArtifactSet,
    stats: &mut WriteStageStats,
) -> Result<Option<FirstFailure>> {
    if artifacts.is_empty() {
        return Ok(None);
    }
    let started = std::time::Instant::now();
    let batch = Arc::new(WriteBatch {
        ctx: ctx.clone(),
        deps: deps.clone(),
        in_flight: InFlightWrites::new(deps.queue_telemetry()),
        progress: WriteProgress::new(
            input.write_progress.label.clone(),
            u64::try_from(artifacts.len()).unwrap_or(u64::MAX),
            input.write_progress.log_interval,
            Arc::clone(&deps.logger),
        ),
        written: Mutex::new(ArtifactSet::new()),
    });
    let tracker = CompletionTracker::new();
    for artifact in artifacts {
        let _handle = tracker.track(write_one(Arc::clone(&batch), artifact));
    }

    let drained = tracker
        .wait(wait_options(ctx, deps, input, "Writing artifacts"))
        .await;

    let batch_written =
        std::mem::take(&mut *batch.written.lock().unwrap_or_else(PoisonError::into_inner));
    for (name, bytes) in batch_written.iter() {
        written.insert(name, bytes.to_vec());
    }
    stats.artifacts += u64::try_from(batch_written.len()).unwrap_or(u64::MAX);
    stats.bytes += batch_written.total_bytes();
    stats.longest_stall_secs = stats.longest_stall_secs.max(batch.in_flight.close());
    stats.duration_ms += elapsed_ms(started);

    match drained {
        Ok(()) => Ok(None),
        Err(error) => match tracker.first_failure() {
            Some(first) if first.error == error => Ok(Some(first)),
            _ => Err(error),
        },
    }
}

async fn write_one(batch: Arc<WriteBatch>, artifact: PendingArtifact) -> Result<()> {
    let request = ScheduleRequest::new(TokenRequest::io(1)).with_bytes(artifact.byte_len());
    let scheduler = batch.deps.scheduler.clone();
    scheduler
        .schedule(queues::STAGE2_WRITE, request, || async {
            let name = artifact.name.clone();
            let bytes = Arc::clone(&artifact.bytes);
            batch.in_flight.begin(&name, artifact.byte_len());
            let result = batch.deps.stages.write_artifact(&batch.ctx, artifact).await;
            batch.in_flight.finish(&name);
            result?;
            batch
                .written
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.clone(), bytes.to_vec());
            batch.progress.record(&name);
            Ok(())
        })
        .await
}
