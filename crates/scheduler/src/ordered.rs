//! Ordered appender: hands results to a sink strictly in index order,
//! whatever order they complete in.

use pairofcleats_shared::{ErrorCode, ErrorEnvelope, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{Notify, oneshot};

const PENDING_HEAD_LEN: usize = 8;

/// Appender options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderedAppenderOptions {
    /// First index expected by the sink.
    pub start_index: usize,
    /// Buffered out-of-order results above which [`OrderedAppender::wait_for_capacity`] blocks.
    pub max_pending_before_backpressure: Option<usize>,
}

/// Appender progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedAppenderSnapshot {
    /// Next index the sink will receive.
    pub next_index: usize,
    /// Buffered results waiting for an earlier index.
    pub pending_count: usize,
    /// Smallest buffered indices.
    pub pending_head: Vec<usize>,
    /// Indices flushed or skipped so far.
    pub completed_count: usize,
}

type Sink<T> = Box<dyn FnMut(usize, T) -> Result<()> + Send>;

struct AppenderState<T> {
    next_index: usize,
    pending: BTreeMap<usize, Option<T>>,
    waiters: BTreeMap<usize, Vec<oneshot::Sender<Result<()>>>>,
    completed_count: usize,
    aborted: Option<ErrorEnvelope>,
    sink: Sink<T>,
}

impl<T> AppenderState<T> {
    fn flush(&mut self) {
        while let Some(entry) = self.pending.remove(&self.next_index) {
            let index = self.next_index;
            if let Some(value) = entry
                && let Err(error) = (self.sink)(index, value)
            {
                tracing::debug!(index, error = %error, "ordered sink failed");
                self.abort(error);
                return;
            }
            self.completed_count += 1;
            self.next_index += 1;
            for waiter in self.waiters.remove(&index).unwrap_or_default() {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    fn abort(&mut self, error: ErrorEnvelope) {
        if self.aborted.is_none() {
            self.aborted = Some(error.clone());
        }
        self.pending.clear();
        for waiter in std::mem::take(&mut self.waiters).into_values().flatten() {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn register(&mut self, index: usize, entry: Option<T>) -> oneshot::Receiver<Result<()>> {
        let (sender, receiver) = oneshot::channel();
        if let Some(error) = &self.aborted {
            let _ = sender.send(Err(error.clone()));
            return receiver;
        }
        if index < self.next_index {
            tracing::debug!(index, next_index = self.next_index, "dropping late duplicate");
            let _ = sender.send(Ok(()));
            return receiver;
        }
        self.pending.entry(index).or_insert(entry);
        self.waiters.entry(index).or_default().push(sender);
        self.flush();
        receiver
    }
}

struct AppenderInner<T> {
    state: Mutex<AppenderState<T>>,
    changed: Notify,
    max_pending: Option<usize>,
}

/// Clonable ordered appender.
pub struct OrderedAppender<T> {
    inner: Arc<AppenderInner<T>>,
}

impl<T> Clone for OrderedAppender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for OrderedAppender<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("OrderedAppender")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl<T> OrderedAppender<T> {
    /// Appender that hands `(index, value)` pairs to `sink` in index order.
    ///
    /// A sink error aborts the appender.
    pub fn new(
        options: OrderedAppenderOptions,
        sink: impl FnMut(usize, T) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(AppenderInner {
                state: Mutex::new(AppenderState {
                    next_index: options.start_index,
                    pending: BTreeMap::new(),
                    waiters: BTreeMap::new(),
                    completed_count: 0,
                    aborted: None,
                    sink: Box::new(sink),
                }),
                changed: Notify::new(),
                max_pending: options.max_pending_before_backpressure.map(|max| max.max(1)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AppenderState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, index: usize, entry: Option<T>) -> FlushWait {
        let receiver = self.lock().register(index, entry);
        self.inner.changed.notify_waiters();
        FlushWait { receiver }
    }

    /// Buffer `value` for `index`; the returned future resolves once that
    /// index has been flushed. A late duplicate of a flushed index is dropped.
    pub fn enqueue(&self, index: usize, value: T) -> FlushWait {
        self.submit(index, Some(value))
    }

    /// Mark `index` as producing no result.
    pub fn skip(&self, index: usize) -> FlushWait {
        self.submit(index, None)
    }

    /// Next index the sink is waiting for.
    #[must_use]
    pub fn peek_next_index(&self) -> usize {
        self.lock().next_index
    }

    /// Current progress.
    #[must_use]
    pub fn snapshot(&self) -> OrderedAppenderSnapshot {
        let state = self.lock();
        OrderedAppenderSnapshot {
            next_index: state.next_index,
            pending_count: state.pending.len(),
            pending_head: state.pending.keys().take(PENDING_HEAD_LEN).copied().collect(),
            completed_count: state.completed_count,
        }
    }

    /// Wait while too many results are buffered, unless `index` is within
    /// `bypass_window` of the next expected index.
    pub async fn wait_for_capacity(&self, index: usize, bypass_window: usize) -> Result<()> {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            {
                let state = self.lock();
                if let Some(error) = &state.aborted {
                    return Err(error.clone());
                }
                if index <= state.next_index.saturating_add(bypass_window) {
                    return Ok(());
                }
                match self.inner.max_pending {
                    Some(max) if state.pending.len() > max => {},
                    _ => return Ok(()),
                }
            }
            changed.await;
        }
    }

    /// Reject every waiter with `error` and fail all later calls.
    pub fn abort(&self, error: ErrorEnvelope) {
        self.lock().abort(error);
        self.inner.changed.notify_waiters();
    }

    /// Error the appender was aborted with, if any.
    #[must_use]
    pub fn abort_error(&self) -> Option<ErrorEnvelope> {
        self.lock().aborted.clone()
    }
}

/// Resolves once an enqueued index has been flushed (or the appender aborted).
#[derive(Debug)]
#[must_use = "the flush result reports sink failures"]
pub struct FlushWait {
    receiver: oneshot::Receiver<Result<()>>,
}

impl Future for FlushWait {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ErrorEnvelope::expected(
                    ErrorCode::cancelled(),
                    "ordered appender dropped before flush",
                ))
            })
        })
    }
}
