//! # pairofcleats-scheduler
//!
//! Concurrency engine for index builds.
//!
//! - [`TokenPool`] - per-class token counters with FIFO waiters
//! - [`admission`] - reject-on-ceiling queue admission
//! - [`BuildScheduler`] - named queues sharing one token pool, with
//!   starvation, fairness scoring and write backpressure
//! - [`CompletionTracker`] - tracks in-flight work and keeps the first failure
//! - [`OrderedAppender`] - hands results to a sink in index order
//! - [`overlap`] - start later stages early and resolve them at a join point
//! - [`telemetry`] - queue-depth snapshots and write progress lines
//!
//! Depends on `ports`, `domain`, and `shared`.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod admission;
pub mod build_scheduler;
pub mod completion;
pub mod ordered;
pub mod overlap;
pub mod telemetry;
pub mod tokens;

pub use admission::{
    AdmissionLimits, AdmissionQueue, AdmissionRejection, QueueAdmissionStats, QueueItem,
    RejectedByReason, SchedulerCounters, normalize_byte_count, try_admit,
};
pub use build_scheduler::{
    ActivityStats, BackpressureReason, BackpressureState, BuildScheduler, BuildSchedulerOptions,
    QueueOptions, QueueStats, ScheduleRequest, SchedulerStats, UtilizationStats,
    WriteBackpressureOptions,
};
pub use completion::{
    CompletionSnapshot, CompletionTracker, FirstFailure, StallReport, TrackedHandle, WaitOptions,
};
pub use ordered::{FlushWait, OrderedAppender, OrderedAppenderOptions, OrderedAppenderSnapshot};
pub use overlap::{
    SpeculativeHandle, maybe_start_early, resolve_at_join_point, should_overlap_postings,
    should_prefetch_vfs,
};
pub use telemetry::{
    PendingSnapshot, QUEUE_DEPTH_SNAPSHOT_INTERVAL_MIN_MS, QueueTelemetry, TRACE_INTERVAL_MIN_MS,
    TelemetryOptions, WriteProgress, format_progress_line, longest_in_flight_age,
};
pub use tokens::{
    TokenClassSnapshot, TokenGrant, TokenLimitUpdate, TokenPool, TokenPoolSnapshot, TokenRequest,
    TokenTotals, apply_scheduler_token_limits,
};

/// Returns the scheduler crate version.
#[must_use]
pub const fn scheduler_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
