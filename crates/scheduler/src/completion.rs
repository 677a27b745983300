//! Ordered completion tracker.
//!
//! Tracks a dynamic set of in-flight operations, keeps the first failure in
//! settlement order, and offers a drain wait with stall reporting, a deadline,
//! and cancellation. Failures are deferred: they only surface once the set has
//! drained.

use pairofcleats_shared::{
    CancelReason, CancellationToken, ErrorClass, ErrorCode, ErrorEnvelope, Result,
};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Pending and failed counts at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompletionSnapshot {
    /// Operations not yet settled.
    pub pending: usize,
    /// Operations that settled with an error.
    pub failed: usize,
}

/// Payload passed to the stall callback on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StallReport {
    /// Operations not yet settled.
    pub pending: usize,
    /// Operations that settled with an error.
    pub failed: usize,
    /// Polls so far in this wait, starting at 1.
    pub stall_count: u64,
    /// Time since the wait started.
    pub elapsed_ms: u64,
}

/// The first failure together with the pending count when it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstFailure {
    /// The error.
    pub error: ErrorEnvelope,
    /// Operations still pending right after the failure settled.
    pub pending: usize,
}

type StallCallback = Box<dyn FnMut(StallReport) + Send>;

/// Drain wait options.
#[derive(Default)]
pub struct WaitOptions {
    stall_poll: Option<Duration>,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    on_stall: Option<StallCallback>,
}

impl fmt::Debug for WaitOptions {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("WaitOptions")
            .field("stall_poll", &self.stall_poll)
            .field("timeout", &self.timeout)
            .field("cancel", &self.cancel.is_some())
            .field("on_stall", &self.on_stall.is_some())
            .finish()
    }
}

impl WaitOptions {
    /// Options from millisecond settings; 0 disables the stall poll or the deadline.
    #[must_use]
    pub fn from_millis(stall_poll_ms: u64, timeout_ms: u64) -> Self {
        Self {
            stall_poll: (stall_poll_ms > 0).then(|| Duration::from_millis(stall_poll_ms)),
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            ..Self::default()
        }
    }

    /// Fail with a timeout error if the set has not drained within `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Call `on_stall` every `poll` while waiting.
    #[must_use]
    pub fn with_stall(mut self, poll: Duration, on_stall: impl FnMut(StallReport) + Send + 'static) -> Self {
        self.stall_poll = Some(poll);
        self.on_stall = Some(Box::new(on_stall));
        self
    }

    /// Install a stall callback, keeping the configured poll period.
    #[must_use]
    pub fn with_stall_callback(mut self, on_stall: impl FnMut(StallReport) + Send + 'static) -> Self {
        self.on_stall = Some(Box::new(on_stall));
        self
    }

    /// Abort the wait when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    pending: usize,
    failed: usize,
    first_failure: Option<FirstFailure>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    state: Mutex<TrackerState>,
    drained: Notify,
}

/// Clonable handle to a completion tracker.
#[derive(Debug, Clone, Default)]
pub struct CompletionTracker {
    inner: Arc<TrackerInner>,
}

impl CompletionTracker {
    /// Empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn and register `operation`; the returned handle yields its result.
    pub fn track<F, T>(&self, operation: F) -> TrackedHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.track_with(operation, |_| {})
    }

    /// Like [`Self::track`], calling `on_settled` with the error (if any) when
    /// the operation settles.
    pub fn track_with<F, T, S>(&self, operation: F, on_settled: S) -> TrackedHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        S: FnOnce(Option<&ErrorEnvelope>) + Send + 'static,
    {
        self.lock().pending += 1;
        let mut guard = SettleGuard {
            tracker: self.clone(),
            on_settled: Some(Box::new(on_settled)),
        };
        let join = tokio::spawn(async move {
            let result = operation.await;
            guard.settle(result.as_ref().err());
            result
        });
        TrackedHandle { join }
    }

    fn settle(&self, error: Option<&ErrorEnvelope>) {
        let drained = {
            let mut state = self.lock();
            state.pending = state.pending.saturating_sub(1);
            if let Some(error) = error {
                state.failed += 1;
                if state.first_failure.is_none() {
                    state.first_failure = Some(FirstFailure {
                        error: error.clone(),
                        pending: state.pending,
                    });
                }
            }
            state.pending == 0
        };
        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    /// Current pending and failed counts.
    #[must_use]
    pub fn snapshot(&self) -> CompletionSnapshot {
        let state = self.lock();
        CompletionSnapshot {
            pending: state.pending,
            failed: state.failed,
        }
    }

    /// The first failure in settlement order, if any.
    #[must_use]
    pub fn first_failure(&self) -> Option<FirstFailure> {
        self.lock().first_failure.clone()
    }

    /// Clear the failure slot and counters of settled operations.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.failed = 0;
        state.first_failure = None;
    }

    /// Wait until nothing is pending, then re-raise the first failure if set.
    ///
    /// Cancelling or timing out the wait leaves tracked operations running.
    pub async fn wait(&self, options: WaitOptions) -> Result<()> {
        let WaitOptions {
            stall_poll,
            timeout,
            cancel,
            mut on_stall,
        } = options;
        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);
        let poll = stall_poll.filter(|_| on_stall.is_some());
        let mut ticker = poll.map(|period| tokio::time::interval_at(started + period, period));
        let mut stall_count = 0u64;

        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if let Some(token) = &cancel
                && token.is_cancelled()
            {
                return Err(aborted_error(token.reason()));
            }
            if self.lock().pending == 0 {
                return self.first_failure().map_or(Ok(()), |failure| Err(failure.error));
            }

            tokio::select! {
                () = &mut drained => {},
                () = cancelled(cancel.as_ref()) => {
                    let reason = cancel.as_ref().and_then(CancellationToken::reason);
                    return Err(aborted_error(reason));
                },
                () = sleep_until(deadline) => {
                    let pending = self.lock().pending;
                    return Err(timeout_error(timeout.unwrap_or_default(), pending));
                },
                _ = tick(ticker.as_mut()) => {
                    stall_count += 1;
                    let snapshot = self.snapshot();
                    let report = StallReport {
                        pending: snapshot.pending,
                        failed: snapshot.failed,
                        stall_count,
                        elapsed_ms: millis(started.elapsed()),
                    };
                    if let Some(callback) = on_stall.as_mut() {
                        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(report)));
                        if outcome.is_err() {
                            tracing::debug!(stall_count, "stall callback panicked");
                        }
                    }
                },
            }
        }
    }
}

struct SettleGuard {
    tracker: CompletionTracker,
    on_settled: Option<Box<dyn FnOnce(Option<&ErrorEnvelope>) + Send>>,
}

impl SettleGuard {
    fn settle(&mut self, error: Option<&ErrorEnvelope>) {
        if let Some(on_settled) = self.on_settled.take() {
            self.tracker.settle(error);
            on_settled(error);
        }
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if self.on_settled.is_some() {
            let error = ErrorEnvelope::unexpected(
                ErrorCode::internal(),
                "tracked operation ended without settling",
                ErrorClass::NonRetriable,
            );
            self.settle(Some(&error));
        }
    }
}

/// Handle to a tracked operation; awaiting it yields the operation's result.
///
/// Dropping the handle detaches the operation; it still settles in the tracker.
#[derive(Debug)]
pub struct TrackedHandle<T> {
    join: JoinHandle<Result<T>>,
}

impl<T> Future for TrackedHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.join).poll(cx).map(|joined| {
            joined.unwrap_or_else(|error| {
                Err(ErrorEnvelope::unexpected(
                    ErrorCode::internal(),
                    format!("tracked operation failed to join: {error}"),
                    ErrorClass::NonRetriable,
                ))
            })
        })
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: Option<&mut tokio::time::Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn timeout_error(timeout: Duration, pending: usize) -> ErrorEnvelope {
    let timeout_ms = millis(timeout);
    ErrorEnvelope::unexpected(
        ErrorCode::ordered_completion_timeout(),
        format!("ordered completion timed out after {timeout_ms}ms with {pending} pending"),
        ErrorClass::Retriable,
    )
    .with_metadata("timeoutMs", timeout_ms.to_string())
    .with_metadata("pending", pending.to_string())
}

fn aborted_error(reason: Option<CancelReason>) -> ErrorEnvelope {
    let error = ErrorEnvelope::expected(
        ErrorCode::ordered_completion_aborted(),
        "ordered completion wait aborted",
    );
    match reason {
        Some(CancelReason::Structured(cause)) => error.with_cause(cause),
        Some(CancelReason::Raw(reason)) => error.with_metadata("reason", reason),
        None => error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::oneshot;

    fn failure(message: &str) -> ErrorEnvelope {
        ErrorEnvelope::expected(ErrorCode::new("test", "failed"), message)
    }

    fn gated(
        tracker: &CompletionTracker,
        outcome: Result<()>,
    ) -> (oneshot::Sender<()>, TrackedHandle<()>) {
        let (open, gate) = oneshot::channel::<()>();
        let handle = tracker.track(async move {
            let _ = gate.await;
            outcome
        });
        (open, handle)
    }

    #[tokio::test]
    async fn handle_yields_the_operation_result() -> Result<()> {
        let tracker = CompletionTracker::new();
        let value = tracker.track(async { Ok(7) }).await?;
        assert_eq!(value, 7);
        tracker.wait(WaitOptions::default()).await?;
        assert_eq!(tracker.snapshot(), CompletionSnapshot::default());
        Ok(())
    }

    #[tokio::test]
    async fn first_failure_follows_settlement_order() -> Result<()> {
        let tracker = CompletionTracker::new();
        let (open_a, a) = gated(&tracker, Err(failure("A")));
        let (open_b, b) = gated(&tracker, Err(failure("B")));
        let (open_c, c) = gated(&tracker, Err(failure("C")));

        let _ = open_b.send(());
        assert!(b.await.is_err());
        let _ = open_a.send(());
        assert!(a.await.is_err());
        let _ = open_c.send(());
        assert!(c.await.is_err());

        let error = tracker.wait(WaitOptions::default()).await.err();
        assert_eq!(error.map(|error| error.message), Some("B".to_owned()));
        assert_eq!(tracker.snapshot().failed, 3);

        let again = tracker.wait(WaitOptions::default()).await.err();
        assert_eq!(again.map(|error| error.message), Some("B".to_owned()));

        tracker.reset();
        tracker.wait(WaitOptions::default()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn first_failure_records_pending_count() {
        let tracker = CompletionTracker::new();
        let (open_ok, ok) = gated(&tracker, Ok(()));
        let failed = tracker.track(async { Err::<(), _>(failure("boom")) });
        assert!(failed.await.is_err());

        assert_eq!(
            tracker.first_failure().map(|failure| failure.pending),
            Some(1)
        );
        let _ = open_ok.send(());
        assert!(ok.await.is_ok());
    }

    #[tokio::test]
    async fn wait_drains_every_tracked_operation() -> Result<()> {
        let tracker = CompletionTracker::new();
        let settled = Arc::new(AtomicU64::new(0));
        for delay in [15u64, 5, 10] {
            let settled = Arc::clone(&settled);
            let _detached = tracker.track_with(
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(())
                },
                move |_| {
                    settled.fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        tracker.wait(WaitOptions::default()).await?;
        assert_eq!(settled.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.snapshot().pending, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_pending_count() {
        let tracker = CompletionTracker::new();
        let (_open, _handle) = gated(&tracker, Ok(()));

        let error = tracker
            .wait(WaitOptions::default().with_timeout(Duration::from_millis(250)))
            .await
            .err();

        assert_eq!(
            error.as_ref().map(|error| error.code.flat()).as_deref(),
            Some("ORDERED_COMPLETION_TIMEOUT")
        );
        assert_eq!(
            error.as_ref().and_then(|error| error.metadata.get("timeoutMs").cloned()),
            Some("250".to_owned())
        );
        assert_eq!(
            error.and_then(|error| error.metadata.get("pending").cloned()),
            Some("1".to_owned())
        );
    }

    #[tokio::test]
    async fn cancellation_preserves_structured_cause() {
        let tracker = CompletionTracker::new();
        let (_open, _handle) = gated(&tracker, Ok(()));
        let token = CancellationToken::new();
        token.cancel_with(CancelReason::Structured(failure("user stop")));

        let error = tracker
            .wait(WaitOptions::default().with_cancellation(token))
            .await
            .err();

        assert_eq!(
            error.as_ref().map(|error| error.code.clone()),
            Some(ErrorCode::ordered_completion_aborted())
        );
        assert_eq!(
            error
                .and_then(|error| error.cause().map(|cause| cause.message.clone())),
            Some("user stop".to_owned())
        );
        assert_eq!(tracker.snapshot().pending, 1);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_attaches_raw_reason() {
        let tracker = CompletionTracker::new();
        let (_open, _handle) = gated(&tracker, Ok(()));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel_with(CancelReason::Raw("shutdown".to_owned()));
        });

        let error = tracker
            .wait(WaitOptions::default().with_cancellation(token))
            .await
            .err();
        assert_eq!(
            error.and_then(|error| error.metadata.get("reason").cloned()),
            Some("shutdown".to_owned())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stall_callback_reports_and_panics_are_swallowed() -> Result<()> {
        let tracker = CompletionTracker::new();
        let (open, handle) = gated(&tracker, Ok(()));
        let reports = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&reports);
        let options = WaitOptions::default().with_stall(Duration::from_millis(100), move |report| {
            recorded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(report);
            assert!(report.stall_count > 1, "first stall report panics on purpose");
        });

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(options).await })
        };
        tokio::time::sleep(Duration::from_millis(350)).await;
        let _ = open.send(());
        handle.await?;

        let joined = waiter.await;
        assert!(matches!(joined, Ok(Ok(()))));

        let reports = reports.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(reports.len(), 3);
        assert_eq!(reports.first().map(|report| report.pending), Some(1));
        assert_eq!(reports.last().map(|report| report.stall_count), Some(3));
        assert_eq!(reports.last().map(|report| report.elapsed_ms), Some(300));
        Ok(())
    }
}
