//! Queue admission guard: reject-on-ceiling per named queue.
//!
//! Admission never suspends. Every attempt, admitted or not, counts as one
//! `scheduled` on both the queue and the global counters.

use pairofcleats_shared::{ErrorClass, ErrorCode, ErrorEnvelope};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::time::Instant;

/// Normalize a byte estimate: non-finite or non-positive values become 0,
/// everything else is floored.
#[must_use]
#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    reason = "value is finite, positive and clamped into the u64 range before the cast"
)]
pub fn normalize_byte_count(value: f64) -> u64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    value.floor().min(u64::MAX as f64) as u64
}

/// Optional ceilings for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionLimits {
    /// Maximum queued items.
    pub max_pending: Option<u64>,
    /// Maximum queued bytes.
    pub max_pending_bytes: Option<u64>,
}

impl AdmissionLimits {
    /// Clamp `max_pending` to at least 1 and treat a zero byte ceiling as unset.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            max_pending: self.max_pending.map(|value| value.max(1)),
            max_pending_bytes: self.max_pending_bytes.filter(|value| *value > 0),
        }
    }
}

/// Admission counters kept per queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueAdmissionStats {
    /// Admission attempts.
    pub scheduled: u64,
    /// Rejections of any kind.
    pub rejected: u64,
    /// Rejections at `maxPending`.
    pub rejected_max_pending: u64,
    /// Rejections at `maxPendingBytes`.
    pub rejected_max_pending_bytes: u64,
}

/// Global rejection breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedByReason {
    /// Queue was at `maxPending`.
    pub max_pending: u64,
    /// Queue was at `maxPendingBytes`.
    pub max_pending_bytes: u64,
    /// Scheduler was shut down.
    pub shutdown: u64,
    /// Pending work was cleared.
    pub cleared: u64,
}

/// Counters shared by every queue of a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerCounters {
    /// Admission attempts.
    pub scheduled: u64,
    /// Work items started.
    pub started: u64,
    /// Work items that returned `Ok`.
    pub completed: u64,
    /// Work items that returned `Err`.
    pub failed: u64,
    /// Rejections of any kind.
    pub rejected: u64,
    /// Starts granted through the starvation rule.
    pub starvation: u64,
    /// Rejection breakdown.
    pub rejected_by_reason: RejectedByReason,
}

/// Queued descriptor.
#[derive(Debug)]
pub struct QueueItem<T> {
    /// Normalized byte size.
    pub bytes: u64,
    /// Admission time.
    pub enqueued_at: Instant,
    /// Caller payload.
    pub payload: T,
}

impl<T> QueueItem<T> {
    /// Item admitted now.
    pub fn new(bytes: u64, payload: T) -> Self {
        Self {
            bytes,
            enqueued_at: Instant::now(),
            payload,
        }
    }
}

/// Ordered pending items plus their running byte total.
#[derive(Debug)]
pub struct AdmissionQueue<T> {
    items: VecDeque<QueueItem<T>>,
    pending_bytes: u64,
    limits: AdmissionLimits,
    stats: QueueAdmissionStats,
}

impl<T> Default for AdmissionQueue<T> {
    fn default() -> Self {
        Self::new(AdmissionLimits::default())
    }
}

impl<T> AdmissionQueue<T> {
    /// Empty queue with normalized limits.
    #[must_use]
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            items: VecDeque::new(),
            pending_bytes: 0,
            limits: limits.normalized(),
            stats: QueueAdmissionStats::default(),
        }
    }

    /// Replace the ceilings; queued items are kept.
    pub fn set_limits(&mut self, limits: AdmissionLimits) {
        self.limits = limits.normalized();
    }

    /// Current ceilings.
    #[must_use]
    pub const fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    /// Admission counters.
    #[must_use]
    pub const fn stats(&self) -> QueueAdmissionStats {
        self.stats
    }

    /// Record a rejection that happened outside [`try_admit`] (clear, shutdown).
    pub const fn record_rejected(&mut self) {
        self.stats.rejected += 1;
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of queued item bytes.
    #[must_use]
    pub const fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    /// Queued items in admission order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueItem<T>> {
        self.items.iter()
    }

    /// Oldest queued item.
    #[must_use]
    pub fn front(&self) -> Option<&QueueItem<T>> {
        self.items.front()
    }

    /// Remove the item at `index`.
    pub fn remove(&mut self, index: usize) -> Option<QueueItem<T>> {
        let item = self.items.remove(index)?;
        self.pending_bytes = self.pending_bytes.saturating_sub(item.bytes);
        Some(item)
    }

    /// Drop items the predicate rejects and return how many were removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&QueueItem<T>) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|item| keep(item));
        self.pending_bytes = self.items.iter().map(|item| item.bytes).sum();
        before - self.items.len()
    }

    /// Remove and return every queued item.
    pub fn drain(&mut self) -> Vec<QueueItem<T>> {
        self.pending_bytes = 0;
        self.items.drain(..).collect()
    }
}

/// Why an item was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionRejection {
    /// Queue already holds `maxPending` items.
    #[error("queue {queue} is at maxPending")]
    MaxPending {
        /// Queue name.
        queue: String,
        /// Ceiling in effect.
        limit: u64,
    },
    /// Admitting the item would exceed `maxPendingBytes`.
    #[error("queue {queue} is at maxPendingBytes")]
    MaxPendingBytes {
        /// Queue name.
        queue: String,
        /// Ceiling in effect.
        limit: u64,
        /// Bytes already queued.
        pending_bytes: u64,
        /// Bytes of the rejected item.
        bytes: u64,
    },
}

impl From<AdmissionRejection> for ErrorEnvelope {
    fn from(rejection: AdmissionRejection) -> Self {
        let message = rejection.to_string();
        match rejection {
            AdmissionRejection::MaxPending { queue, limit } => Self::expected_with_class(
                ErrorCode::queue_max_pending(),
                message,
                ErrorClass::Retriable,
            )
            .with_metadata("queue", queue)
            .with_metadata("maxPending", limit.to_string()),
            AdmissionRejection::MaxPendingBytes {
                queue,
                limit,
                pending_bytes,
                bytes,
            } => Self::expected_with_class(
                ErrorCode::queue_max_pending_bytes(),
                message,
                ErrorClass::Retriable,
            )
            .with_metadata("queue", queue)
            .with_metadata("maxPendingBytes", limit.to_string())
            .with_metadata("pendingBytes", pending_bytes.to_string())
            .with_metadata("bytes", bytes.to_string()),
        }
    }
}

/// Admit `item` into `queue` or reject it against the queue ceilings.
///
/// Checks run in order: `maxPending`, then `maxPendingBytes` (only for items
/// with a byte size). An item is always admitted into a completely empty
/// queue, even when it alone exceeds the byte ceiling.
pub fn try_admit<T>(
    name: &str,
    queue: &mut AdmissionQueue<T>,
    item: QueueItem<T>,
    counters: &mut SchedulerCounters,
) -> Result<(), AdmissionRejection> {
    queue.stats.scheduled += 1;
    counters.scheduled += 1;

    if let Some(limit) = queue.limits.max_pending
        && queue.items.len() as u64 >= limit
    {
        queue.stats.rejected += 1;
        queue.stats.rejected_max_pending += 1;
        counters.rejected += 1;
        counters.rejected_by_reason.max_pending += 1;
        return Err(AdmissionRejection::MaxPending {
            queue: name.to_owned(),
            limit,
        });
    }

    if let Some(limit) = queue.limits.max_pending_bytes
        && item.bytes > 0
    {
        let oversize_single = queue.items.is_empty() && queue.pending_bytes == 0;
        let next = queue.pending_bytes.saturating_add(item.bytes);
        if !oversize_single && next > limit {
            queue.stats.rejected += 1;
            queue.stats.rejected_max_pending_bytes += 1;
            counters.rejected += 1;
            counters.rejected_by_reason.max_pending_bytes += 1;
            return Err(AdmissionRejection::MaxPendingBytes {
                queue: name.to_owned(),
                limit,
                pending_bytes: queue.pending_bytes,
                bytes: item.bytes,
            });
        }
    }

    queue.pending_bytes = queue.pending_bytes.saturating_add(item.bytes);
    queue.items.push_back(item);
    Ok(())
}
