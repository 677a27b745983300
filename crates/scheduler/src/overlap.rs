//! Pipeline phase overlap: start a later stage early when its inputs are
//! already known, and decide at the join point whether to use the result.

use pairofcleats_domain::{IndexMode, OverlapResolution};
use pairofcleats_shared::{ErrorClass, ErrorCode, ErrorEnvelope, Result};
use std::future::Future;
use tokio::task::JoinHandle;

/// Early postings: code mode with overlap, `inferPostings` and cross-file inference on.
#[must_use]
pub const fn should_overlap_postings(
    mode: IndexMode,
    overlap_enabled: bool,
    infer_postings: bool,
    cross_file_inference: bool,
) -> bool {
    mode.is_code() && overlap_enabled && infer_postings && cross_file_inference
}

/// Incremental VFS row prefetch: code mode with cross-file inference and incremental on.
#[must_use]
pub const fn should_prefetch_vfs(
    mode: IndexMode,
    cross_file_inference: bool,
    incremental: bool,
) -> bool {
    mode.is_code() && cross_file_inference && incremental
}

/// Work started ahead of its join point.
///
/// Discarding or dropping the handle detaches the background task: the work
/// runs to completion and its result is ignored.
#[derive(Debug)]
#[must_use = "a speculative handle should be joined or discarded"]
pub struct SpeculativeHandle<T> {
    feature: String,
    task: Option<JoinHandle<Result<T>>>,
}

impl<T> SpeculativeHandle<T> {
    /// Overlap feature name.
    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// True once the early work has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Ignore the early result. The work itself keeps running.
    pub fn discard(mut self) {
        if let Some(task) = self.task.take() {
            tracing::debug!(
                feature = %self.feature,
                finished = task.is_finished(),
                "speculative work discarded"
            );
            drop(task);
        }
    }

    /// Wait for the early result.
    pub async fn join(mut self) -> Result<T> {
        let Some(task) = self.task.take() else {
            return Err(ErrorEnvelope::cancelled(format!(
                "speculative {} was already consumed",
                self.feature
            )));
        };
        match task.await {
            Ok(result) => result,
            Err(error) if error.is_cancelled() => Err(ErrorEnvelope::cancelled(format!(
                "speculative {} was aborted",
                self.feature
            ))),
            Err(error) => Err(ErrorEnvelope::unexpected(
                ErrorCode::internal(),
                format!("speculative {} panicked: {error}", self.feature),
                ErrorClass::NonRetriable,
            )
            .with_metadata("feature", self.feature.clone())),
        }
    }
}

/// Start `start` on a background task when `condition` holds.
///
/// A failure of the early work is only logged here; it surfaces to the caller
/// at [`resolve_at_join_point`] if the result is consumed.
pub fn maybe_start_early<F, Fut, T>(
    feature: &str,
    condition: bool,
    start: F,
) -> Option<SpeculativeHandle<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    if !condition {
        return None;
    }
    let work = start();
    let name = feature.to_owned();
    let task = tokio::spawn(async move {
        let result = work.await;
        if let Err(error) = &result {
            tracing::debug!(feature = %name, error = %error, "speculative work failed");
        }
        result
    });
    tracing::debug!(feature, "speculative work started");
    Some(SpeculativeHandle {
        feature: feature.to_owned(),
        task: Some(task),
    })
}

/// Consume the early result when it exists and `confirmed` holds; otherwise
/// discard it and run `fallback`.
pub async fn resolve_at_join_point<T, F, Fut>(
    feature: &str,
    handle: Option<SpeculativeHandle<T>>,
    confirmed: bool,
    fallback: F,
) -> Result<(T, OverlapResolution)>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match handle {
        Some(handle) if confirmed => {
            let value = handle.join().await?;
            tracing::debug!(feature, "speculative work joined");
            Ok((value, OverlapResolution::Joined))
        },
        Some(handle) => {
            handle.discard();
            Ok((fallback().await?, OverlapResolution::Discarded))
        },
        None => Ok((fallback().await?, OverlapResolution::NotStarted)),
    }
}
