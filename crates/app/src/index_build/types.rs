//! Shared types for the `run_index_build` pipeline.

use crate::pipeline_fsm::IndexBuildState;
use pairofcleats_domain::{ArtifactSet, BuildStatus, IndexMode, OverlapResolution, SourceFile};
use pairofcleats_ports::{
    IndexStagesPort, InFlightTelemetryPort, LoggerPort, NoopInFlightTelemetry, NoopLogger,
    RelationsRequest,
};
use pairofcleats_scheduler::{BuildScheduler, QueueTelemetry, SchedulerStats};
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Collaborators of an index build.
#[derive(Clone)]
pub struct IndexBuildDeps {
    /// Scheduler every stage runs through.
    pub scheduler: BuildScheduler,
    /// Stage implementations.
    pub stages: Arc<dyn IndexStagesPort>,
    /// Status-line logger.
    pub logger: Arc<dyn LoggerPort>,
    /// In-flight byte telemetry for artifact writes.
    pub telemetry: Arc<dyn InFlightTelemetryPort>,
}

impl IndexBuildDeps {
    /// Deps with a no-op logger and telemetry sink.
    #[must_use]
    pub fn new(scheduler: BuildScheduler, stages: Arc<dyn IndexStagesPort>) -> Self {
        Self {
            scheduler,
            stages,
            logger: Arc::new(NoopLogger),
            telemetry: Arc::new(NoopInFlightTelemetry),
        }
    }

    /// Replace the logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn LoggerPort>) -> Self {
        self.logger = logger;
        self
    }

    /// Replace the telemetry sink.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn InFlightTelemetryPort>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub(crate) fn queue_telemetry(&self) -> QueueTelemetry {
        QueueTelemetry::new(Arc::clone(&self.telemetry))
    }
}

impl std::fmt::Debug for IndexBuildDeps {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("IndexBuildDeps")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Overlap toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlapSettings {
    /// Master switch for stage overlap.
    pub enabled: bool,
    /// Start postings while relations run.
    pub infer_postings: bool,
}

impl Default for OverlapSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            infer_postings: true,
        }
    }
}

/// Drain settings for tracked work; 0 disables the poll or the deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionSettings {
    /// Stall poll period in milliseconds.
    pub stall_poll_ms: u64,
    /// Drain deadline in milliseconds.
    pub timeout_ms: u64,
}

/// Artifact write progress settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteProgressSettings {
    /// Line label.
    pub label: String,
    /// Minimum time between lines.
    pub log_interval: Duration,
}

impl Default for WriteProgressSettings {
    fn default() -> Self {
        Self {
            label: "Writing index files".to_owned(),
            log_interval: Duration::from_secs(1),
        }
    }
}

/// Input for `run_index_build`.
#[derive(Debug, Clone, Default)]
pub struct IndexBuildInput {
    /// Files to index; their position is their index.
    pub files: Vec<SourceFile>,
    /// Corpus mode.
    pub mode: IndexMode,
    /// Cross-file passes to run.
    pub relations: RelationsRequest,
    /// Produce incremental bundles.
    pub incremental: bool,
    /// Overlap toggles.
    pub overlap: OverlapSettings,
    /// Drain settings.
    pub completion: CompletionSettings,
    /// Write progress settings.
    pub write_progress: WriteProgressSettings,
    /// Processed files buffered out of order before submission pauses.
    pub max_buffered_files: Option<usize>,
}

/// File stage stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStageStats {
    /// Files submitted.
    pub files: u64,
    /// Files that failed.
    pub failed: u64,
    /// Chunks produced.
    pub chunks: u64,
    /// Elapsed time in milliseconds.
    pub duration_ms: u64,
}

/// Relations stage stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationsStageStats {
    /// Whether any relations pass ran.
    pub ran: bool,
    /// Whether cross-file inference ran.
    pub cross_file_enabled: bool,
    /// Files with at least one resolved import.
    pub edges: u64,
    /// Elapsed time in milliseconds.
    pub duration_ms: u64,
}

/// Postings stage stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostingsStageStats {
    /// Distinct terms.
    pub terms: u64,
    /// Time spent at the join point in milliseconds.
    pub join_ms: u64,
}

/// Write stage stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteStageStats {
    /// Artifacts written.
    pub artifacts: u64,
    /// Bytes written.
    pub bytes: u64,
    /// Age in seconds of the oldest write seen in flight.
    pub longest_stall_secs: u64,
    /// Elapsed time in milliseconds.
    pub duration_ms: u64,
}

/// Per-stage stats of one build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexBuildStageStats {
    /// File processing.
    pub files: FileStageStats,
    /// Relations.
    pub relations: RelationsStageStats,
    /// Postings.
    pub postings: PostingsStageStats,
    /// Artifact writes.
    pub write: WriteStageStats,
}

/// How each overlap was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlapReport {
    /// Early postings.
    pub postings: OverlapResolution,
    /// Incremental VFS row prefetch.
    pub vfs_prefetch: OverlapResolution,
}

impl Default for OverlapReport {
    fn default() -> Self {
        Self {
            postings: OverlapResolution::NotStarted,
            vfs_prefetch: OverlapResolution::NotStarted,
        }
    }
}

/// Result of `run_index_build`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexBuildOutput {
    /// Terminal status.
    pub status: BuildStatus,
    /// Artifacts written, by name.
    #[serde(skip)]
    pub artifacts: ArtifactSet,
    /// SHA-256 per artifact.
    pub digests: BTreeMap<Box<str>, String>,
    /// SHA-256 over every `name:digest` line.
    pub combined_digest: String,
    /// Per-stage stats.
    pub stage_stats: IndexBuildStageStats,
    /// Overlap resolutions.
    pub overlap: OverlapReport,
    /// Scheduler stats at the end of the build.
    pub scheduler: SchedulerStats,
}

impl IndexBuildOutput {
    pub(crate) fn new(
        status: BuildStatus,
        artifacts: ArtifactSet,
        stage_stats: IndexBuildStageStats,
        overlap: OverlapReport,
        scheduler: SchedulerStats,
    ) -> Self {
        Self {
            status,
            digests: artifacts.digests(),
            combined_digest: artifacts.combined_digest(),
            artifacts,
            stage_stats,
            overlap,
            scheduler,
        }
    }

    /// True when the build completed.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.status, BuildStatus::Completed)
    }
}

/// Typestate wrapper over the pipeline FSM.
pub(crate) struct IndexBuild<S> {
    pub(crate) fsm: IndexBuildFsm,
    pub(crate) _state: PhantomData<S>,
}

/// Current FSM state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexBuildFsm {
    pub(crate) state: IndexBuildState,
}

impl IndexBuildFsm {
    pub(crate) const fn new() -> Self {
        Self {
            state: IndexBuildState::Prepared,
        }
    }
}
