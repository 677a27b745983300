//! Build an index: process files, run relations and postings with stage
//! overlap, then write artifacts and incremental bundles.

mod files;
mod types;
mod writer;

pub use types::{
    CompletionSettings, FileStageStats, IndexBuildDeps, IndexBuildInput, IndexBuildOutput,
    IndexBuildStageStats, OverlapReport, OverlapSettings, PostingsStageStats,
    RelationsStageStats, WriteProgressSettings, WriteStageStats,
};

use crate::pipeline_fsm::{INDEX_BUILD_TRANSITIONS, IndexBuildState};
use files::{FilesOutcome, elapsed_ms, process_files};
use pairofcleats_domain::{
    ArtifactSet, BuildStatus, PostingsIndex, ProcessedFile, RelationsOutcome, VfsRow, queues,
};
use pairofcleats_ports::{ArtifactInputs, log_fields};
use pairofcleats_scheduler::{
    FirstFailure, SpeculativeHandle, TokenRequest, maybe_start_early, resolve_at_join_point,
    should_overlap_postings, should_prefetch_vfs,
};
use pairofcleats_shared::{ErrorClass, ErrorCode, ErrorEnvelope, RequestContext, Result};
use serde_json::json;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use types::{IndexBuild, IndexBuildFsm};
use writer::write_artifacts;

const POSTINGS_FEATURE: &str = "postings";
const VFS_PREFETCH_FEATURE: &str = "vfs-prefetch";

struct Prepared;
struct FilesProcessed;
struct Relations;
struct Postings;
struct Written;
struct Completed;

impl IndexBuild<Prepared> {
    const fn new() -> Self {
        Self {
            fsm: IndexBuildFsm::new(),
            _state: PhantomData,
        }
    }

    fn files_processed(self) -> Result<IndexBuild<FilesProcessed>> {
        self.transition(IndexBuildState::FilesProcessed)
    }
}

impl IndexBuild<FilesProcessed> {
    fn relations(self) -> Result<IndexBuild<Relations>> {
        self.transition(IndexBuildState::Relations)
    }
}

impl IndexBuild<Relations> {
    fn postings(self) -> Result<IndexBuild<Postings>> {
        self.transition(IndexBuildState::Postings)
    }
}

impl IndexBuild<Postings> {
    fn written(self) -> Result<IndexBuild<Written>> {
        self.transition(IndexBuildState::Written)
    }
}

impl IndexBuild<Written> {
    fn completed(self) -> Result<IndexBuild<Completed>> {
        self.transition(IndexBuildState::Completed)
    }
}

impl<S> IndexBuild<S> {
    fn transition<T>(self, next: IndexBuildState) -> Result<IndexBuild<T>> {
        let mut fsm = self.fsm;
        fsm.transition(next)?;
        Ok(IndexBuild {
            fsm,
            _state: PhantomData,
        })
    }
}

impl IndexBuildFsm {
    fn transition(&mut self, next: IndexBuildState) -> Result<()> {
        if is_allowed_transition(self.state, next) {
            self.state = next;
            return Ok(());
        }
        Err(ErrorEnvelope::unexpected(
            ErrorCode::internal(),
            format!(
                "invalid index build transition: {} -> {}",
                self.state.as_str(),
                next.as_str()
            ),
            ErrorClass::NonRetriable,
        ))
    }
}

fn is_allowed_transition(from: IndexBuildState, to: IndexBuildState) -> bool {
    INDEX_BUILD_TRANSITIONS
        .iter()
        .any(|(source, target)| *source == from && *target == to)
}

/// Mutable bookkeeping carried through one build.
#[derive(Default)]
struct BuildProgress {
    stats: IndexBuildStageStats,
    overlap: OverlapReport,
    written: ArtifactSet,
}

impl BuildProgress {
    fn finish(self, deps: &IndexBuildDeps, status: BuildStatus) -> IndexBuildOutput {
        IndexBuildOutput::new(
            status,
            self.written,
            self.stats,
            self.overlap,
            deps.scheduler.stats(),
        )
    }

    fn failed(self, deps: &IndexBuildDeps, failure: FirstFailure) -> IndexBuildOutput {
        let status = BuildStatus::Failed {
            error: failure.error,
            pending: failure.pending,
        };
        deps.logger.error(
            "index.build_failed",
            &status.summary(),
            serde_json::to_value(&status).ok(),
        );
        self.finish(deps, status)
    }
}

/// Run an index build over `input.files`.
///
/// A failing file or artifact write ends the build with
/// [`BuildStatus::Failed`], carrying the first failure in settlement order.
/// Cancellation, drain timeouts and failures of the postings or relations
/// stages are returned as errors.
#[tracing::instrument(
    name = "index.build",
    skip_all,
    fields(correlation_id = %ctx.correlation_id(), files = input.files.len(), mode = %input.mode)
)]
pub async fn run_index_build(
    ctx: &RequestContext,
    deps: &IndexBuildDeps,
    input: IndexBuildInput,
) -> Result<IndexBuildOutput> {
    ctx.ensure_not_cancelled("run_index_build")?;
    let pipeline = IndexBuild::<Prepared>::new();
    let mut progress = BuildProgress::default();

    let files = match process_files(ctx, deps, &input, &mut progress.stats.files).await? {
        FilesOutcome::Processed(files) => files,
        FilesOutcome::Failed(failure) => return Ok(progress.failed(deps, failure)),
    };
    let pipeline = pipeline.files_processed()?;
    let files: Arc<[ProcessedFile]> = files.into();
    deps.logger.info(
        "index.files_processed",
        "files processed",
        Some(log_fields([
            ("files", json!(files.len())),
            ("chunks", json!(progress.stats.files.chunks)),
        ])),
    );

    let vfs_handle = start_vfs_prefetch(ctx, deps, &input, &files);
    let postings_handle = start_early_postings(ctx, deps, &input, &files);

    let relations = run_relations(ctx, deps, &input, &files, &mut progress).await?;
    let pipeline = pipeline.relations()?;

    let join_started = Instant::now();
    let (postings, resolution) = resolve_at_join_point(
        POSTINGS_FEATURE,
        postings_handle,
        true,
        || schedule_postings(ctx, deps, Arc::clone(&files)),
    )
    .await?;
    progress.overlap.postings = resolution;
    progress.stats.postings.terms = u64::try_from(postings.terms.len()).unwrap_or(u64::MAX);
    progress.stats.postings.join_ms = elapsed_ms(join_started);
    let pipeline = pipeline.postings()?;

    let cross_file_ran = relations.cross_file_enabled;
    let artifacts = deps.stages.serialize_artifacts(&ArtifactInputs {
        mode: input.mode,
        files: Arc::clone(&files),
        postings,
        relations,
    })?;
    if let Some(failure) = write_artifacts(
        ctx,
        deps,
        &input,
        artifacts,
        &mut progress.written,
        &mut progress.stats.write,
    )
    .await?
    {
        return Ok(progress.failed(deps, failure));
    }

    if input.incremental {
        let (prefetched, resolution) = resolve_at_join_point(
            VFS_PREFETCH_FEATURE,
            vfs_handle,
            cross_file_ran,
            || async { Ok(None) },
        )
        .await?;
        progress.overlap.vfs_prefetch = resolution;
        let bundles = deps
            .scheduler
            .schedule(queues::STAGE2_RELATIONS_IO, TokenRequest::io(1), || {
                deps.stages
                    .update_incremental_bundles(ctx, Arc::clone(&files), prefetched)
            })
            .await?;
        if let Some(failure) = write_artifacts(
            ctx,
            deps,
            &input,
            bundles,
            &mut progress.written,
            &mut progress.stats.write,
        )
        .await?
        {
            return Ok(progress.failed(deps, failure));
        }
    } else if let Some(handle) = vfs_handle {
        handle.discard();
    }
    let pipeline = pipeline.written()?;

    let _pipeline = pipeline.completed()?;
    tracing::debug!(
        artifacts = progress.written.len(),
        postings = progress.overlap.postings.as_str(),
        vfs_prefetch = progress.overlap.vfs_prefetch.as_str(),
        "index build completed"
    );
    Ok(progress.finish(deps, BuildStatus::Completed))
}

fn start_early_postings(
    ctx: &RequestContext,
    deps: &IndexBuildDeps,
    input: &IndexBuildInput,
    files: &Arc<[ProcessedFile]>,
) -> Option<SpeculativeHandle<PostingsIndex>> {
    let condition = should_overlap_postings(
        input.mode,
        input.overlap.enabled,
        input.overlap.infer_postings,
        input.relations.cross_file_inference,
    );
    maybe_start_early(POSTINGS_FEATURE, condition, || {
        let ctx = ctx.clone();
        let deps = deps.clone();
        let files = Arc::clone(files);
        async move { schedule_postings(&ctx, &deps, files).await }
    })
}

fn start_vfs_prefetch(
    ctx: &RequestContext,
    deps: &IndexBuildDeps,
    input: &IndexBuildInput,
    files: &Arc<[ProcessedFile]>,
) -> Option<SpeculativeHandle<Option<Vec<VfsRow>>>> {
    let condition = should_prefetch_vfs(
        input.mode,
        input.relations.cross_file_inference,
        input.incremental,
    );
    maybe_start_early(VFS_PREFETCH_FEATURE, condition, || {
        let ctx = ctx.clone();
        let deps = deps.clone();
        let files = Arc::clone(files);
        async move {
            let rows = deps
                .scheduler
                .schedule(queues::STAGE2_RELATIONS_IO, TokenRequest::io(1), || {
                    deps.stages.prepare_vfs_rows(&ctx, files)
                })
                .await?;
            Ok(Some(rows))
        }
    })
}

async fn schedule_postings(
    ctx: &RequestContext,
    deps: &IndexBuildDeps,
    files: Arc<[ProcessedFile]>,
) -> Result<PostingsIndex> {
    deps.scheduler
        .schedule(queues::STAGE1_POSTINGS, TokenRequest::cpu(1), || {
            deps.stages.build_postings(ctx, files)
        })
        .await
}

async fn run_relations(
    ctx: &RequestContext,
    deps: &IndexBuildDeps,
    input: &IndexBuildInput,
    files: &Arc<[ProcessedFile]>,
    progress: &mut BuildProgress,
) -> Result<RelationsOutcome> {
    if !input.relations.any() {
        return Ok(RelationsOutcome::default());
    }
    let started = Instant::now();
    let outcome = deps
        .scheduler
        .schedule(
            queues::STAGE2_RELATIONS,
            TokenRequest::cpu(1).with_mem(1),
            || deps.stages.run_relations(ctx, Arc::clone(files), input.relations),
        )
        .await?;
    let stats = &mut progress.stats.relations;
    stats.ran = true;
    stats.cross_file_enabled = outcome.cross_file_enabled;
    stats.edges = u64::try_from(outcome.graph.edges.len()).unwrap_or(u64::MAX);
    stats.duration_ms = elapsed_ms(started);
    Ok(outcome)
}
