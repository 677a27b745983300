//! Request-scoped context and cancellation.
//!
//! Cancellation is cooperative: cancelling a token wakes every waiter but
//! never interrupts work that is already running. A token may carry a
//! reason, either a structured [`ErrorEnvelope`] or a raw description.

use crate::{ErrorEnvelope, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// A correlation identifier used for logging/telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Create a new request id, unique within this process.
    #[must_use]
    pub fn new_request_id() -> Self {
        next_scoped_id(&REQUEST_ID_COUNTER, "req_")
    }

    /// Create a new build id, unique within this process.
    #[must_use]
    pub fn new_build_id() -> Self {
        next_scoped_id(&BUILD_ID_COUNTER, "build_")
    }

    /// Borrow the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static BUILD_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_scoped_id(counter: &AtomicU64, prefix: &'static str) -> CorrelationId {
    let n = counter.fetch_add(1, Ordering::Relaxed);
    CorrelationId(Arc::<str>::from(format!("{prefix}{n}")))
}

/// Why a token was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// A structured error supplied by the canceller.
    Structured(ErrorEnvelope),
    /// A free-form description.
    Raw(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structured(error) => write!(formatter, "{error}"),
            Self::Raw(reason) => formatter.write_str(reason),
        }
    }
}

/// A clonable cancellation token that can be awaited.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<CancellationState>,
}

#[derive(Debug)]
struct CancellationState {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

impl CancellationToken {
    /// Create a new token in the non-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Cancel the token without a reason.
    pub fn cancel(&self) {
        self.finish(None);
    }

    /// Cancel the token and record why. Only the first reason is kept.
    pub fn cancel_with(&self, reason: CancelReason) {
        self.finish(Some(reason));
    }

    fn finish(&self, reason: Option<CancelReason>) {
        {
            let mut slot = self
                .inner
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.is_cancelled() && slot.is_none() {
                *slot = reason;
            }
        }
        let was_cancelled = self.inner.cancelled.swap(true, Ordering::SeqCst);
        if !was_cancelled {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns true if the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if one was given.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }

        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Request-scoped context passed across boundaries.
#[derive(Debug, Clone)]
pub struct RequestContext {
    correlation_id: CorrelationId,
    cancellation: CancellationToken,
}

impl RequestContext {
    /// Create a new request context with a fresh cancellation token.
    #[must_use]
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            cancellation: CancellationToken::new(),
        }
    }

    /// Convenience constructor: create a context with an auto-generated `req_*` id.
    #[must_use]
    pub fn new_request() -> Self {
        Self::new(CorrelationId::new_request_id())
    }

    /// Return the correlation id.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Return a clone of the cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Returns true if the request was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cancel this request.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Await cancellation.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Return a cancellation error when cancelled, including operation metadata.
    pub fn ensure_not_cancelled(&self, operation: &'static str) -> Result<()> {
        if self.is_cancelled() {
            return Err(ErrorEnvelope::cancelled("operation cancelled")
                .with_metadata("operation", operation));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn generated_ids_are_prefixed_and_distinct() {
        let first = CorrelationId::new_build_id();
        let second = CorrelationId::new_build_id();
        assert!(first.as_str().starts_with("build_"));
        assert_ne!(first, second);
    }

    #[test]
    fn first_cancel_reason_wins() {
        let token = CancellationToken::new();
        token.cancel_with(CancelReason::Raw("first".to_owned()));
        token.cancel_with(CancelReason::Raw("second".to_owned()));

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Raw("first".to_owned())));
    }

    #[test]
    fn plain_cancel_has_no_reason() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), None);
    }

    #[tokio::test]
    async fn waiters_wake_on_cancel() -> Result<()> {
        let ctx = RequestContext::new_request();
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .map_err(|_| ErrorEnvelope::cancelled("waiter never woke"))?
            .map_err(|_| ErrorEnvelope::cancelled("waiter panicked"))?;

        let err = ctx.ensure_not_cancelled("test_op");
        assert!(matches!(err, Err(ref error) if error.is_cancelled()));
        Ok(())
    }
}
