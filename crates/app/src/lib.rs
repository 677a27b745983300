//! # pairofcleats-app
//!
//! Application use cases for index builds.
//! This crate depends on `ports`, `domain`, `shared`, and `scheduler`.

pub mod index_build;
pub mod pipeline_fsm;

pub use index_build::{
    CompletionSettings, FileStageStats, IndexBuildDeps, IndexBuildInput, IndexBuildOutput,
    IndexBuildStageStats, OverlapReport, OverlapSettings, PostingsStageStats,
    RelationsStageStats, WriteProgressSettings, WriteStageStats, run_index_build,
};
pub use pipeline_fsm::{INDEX_BUILD_STATES, INDEX_BUILD_TRANSITIONS, IndexBuildState};

/// Returns the app crate version.
#[must_use]
pub const fn app_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
