//! # pairofcleats-shared
//!
//! Shared result types, error envelopes, and request context for the
//! pairofcleats build workspace.
//!
//! - [`ErrorEnvelope`] is the one error type crossing crate boundaries.
//! - [`RequestContext`] carries a correlation id and a cancellation token.
//! - [`CancellationToken`] can record a [`CancelReason`].
//!
//! This crate has no workspace dependencies.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod concurrency;
pub mod errors;
pub mod result;

pub use concurrency::{CancelReason, CancellationToken, CorrelationId, RequestContext};
pub use errors::{
    ErrorClass, ErrorCode, ErrorEnvelope, ErrorKind, ErrorMetadata, ORDERED_COMPLETION_NAMESPACE,
    SCHEDULER_NAMESPACE,
};
pub use result::Result;

/// Returns the shared crate version.
#[must_use]
pub const fn shared_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
