//! Build scheduler: named queues drawing from one token pool.
//!
//! Work is admitted through the queue admission guard, then waits for a start
//! permit. The pump hands out permits one at a time, choosing the queue by
//! starvation first and a wait/weight/priority score otherwise, and only when
//! the token pool can reserve every class the item needs.

use crate::admission::{
    AdmissionLimits, AdmissionQueue, QueueItem, SchedulerCounters, normalize_byte_count,
    try_admit,
};
use crate::telemetry::{PendingSnapshot, QueueTelemetry, TelemetryOptions};
use crate::tokens::{
    TokenGrant, TokenLimitUpdate, TokenPool, TokenPoolSnapshot, TokenRequest, TokenTotals,
};
use pairofcleats_domain::{ResourceClass, queues};
use pairofcleats_shared::{ErrorCode, ErrorEnvelope, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

const WAIT_SAMPLE_LIMIT: usize = 64;
const WEIGHT_BOOST_MS: i64 = 250;
const PRIORITY_PENALTY_MS: i64 = 5;
const DEFAULT_CLEAR_REASON: &str = "scheduler queue cleared";

/// Per-queue scheduling options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    /// Lower runs first on score ties; each point costs 5ms of score.
    pub priority: i32,
    /// Each point adds 250ms of score.
    pub weight: u32,
    /// Admission item ceiling.
    pub max_pending: Option<u64>,
    /// Admission byte ceiling.
    pub max_pending_bytes: Option<u64>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            priority: 50,
            weight: 1,
            max_pending: None,
            max_pending_bytes: None,
        }
    }
}

impl QueueOptions {
    fn limits(self) -> AdmissionLimits {
        AdmissionLimits {
            max_pending: self.max_pending,
            max_pending_bytes: self.max_pending_bytes,
        }
        .normalized()
    }
}

/// Write-queue thresholds that pause producer queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteBackpressureOptions {
    /// Enable producer throttling.
    pub enabled: bool,
    /// Watched queue; never blocked itself.
    pub write_queue: String,
    /// Queues that stop starting work while backpressure is active.
    pub producer_queues: BTreeSet<String>,
    /// Pending count threshold; 0 disables this trigger.
    pub pending_threshold: u64,
    /// Pending byte threshold; 0 disables this trigger.
    pub pending_bytes_threshold: u64,
    /// Oldest-wait threshold; 0 disables this trigger.
    pub oldest_wait_ms_threshold: u64,
}

impl Default for WriteBackpressureOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            write_queue: queues::STAGE2_WRITE.to_owned(),
            producer_queues: queues::WRITE_PRODUCERS
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
            pending_threshold: 128,
            pending_bytes_threshold: 256 * 1024 * 1024,
            oldest_wait_ms_threshold: 15_000,
        }
    }
}

/// Scheduler construction options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSchedulerOptions {
    /// When false, `schedule` runs work immediately without queueing.
    pub enabled: bool,
    /// Token totals.
    pub tokens: TokenTotals,
    /// Wait after which a queue head is started ahead of the score order.
    pub starvation_ms: u64,
    /// Queues registered up front.
    pub queues: BTreeMap<String, QueueOptions>,
    /// Producer throttling.
    pub write_backpressure: WriteBackpressureOptions,
    /// Telemetry options.
    pub telemetry: TelemetryOptions,
}

impl Default for BuildSchedulerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            tokens: TokenTotals::default(),
            starvation_ms: 30_000,
            queues: BTreeMap::new(),
            write_backpressure: WriteBackpressureOptions::default(),
            telemetry: TelemetryOptions::default(),
        }
    }
}

/// Tokens and byte size of one unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleRequest {
    /// Tokens reserved while the work runs.
    pub tokens: TokenRequest,
    /// Bytes counted against the queue byte ceiling while pending.
    pub bytes: u64,
}

impl ScheduleRequest {
    /// Request for `tokens` with no byte size.
    #[must_use]
    pub const fn new(tokens: TokenRequest) -> Self {
        Self { tokens, bytes: 0 }
    }

    /// Attach an exact byte size.
    #[must_use]
    pub const fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    /// Attach a byte estimate; non-finite or non-positive estimates count as 0.
    #[must_use]
    pub fn with_byte_estimate(self, estimate: f64) -> Self {
        self.with_bytes(normalize_byte_count(estimate))
    }
}

impl From<TokenRequest> for ScheduleRequest {
    fn from(tokens: TokenRequest) -> Self {
        Self::new(tokens)
    }
}

/// Why write backpressure is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BackpressureReason {
    /// Pending count reached its threshold.
    Pending,
    /// Pending bytes reached their threshold.
    PendingBytes,
    /// Oldest pending item waited past its threshold.
    OldestWaitMs,
}

/// Write backpressure state at the time of the last evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureState {
    /// Producers are paused.
    pub active: bool,
    /// Triggers that fired.
    pub reasons: Vec<BackpressureReason>,
    /// Write queue pending count.
    pub pending: u64,
    /// Write queue pending bytes.
    pub pending_bytes: u64,
    /// Write queue oldest wait.
    pub oldest_wait_ms: u64,
}

/// Per-queue statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Queued items.
    pub pending: u64,
    /// Queued bytes.
    pub pending_bytes: u64,
    /// Items holding a permit.
    pub running: u64,
    /// Item ceiling.
    pub max_pending: Option<u64>,
    /// Byte ceiling.
    pub max_pending_bytes: Option<u64>,
    /// Configured priority.
    pub priority: i32,
    /// Configured weight.
    pub weight: u32,
    /// Wait of the oldest queued item.
    pub oldest_wait_ms: u64,
    /// Admission attempts.
    pub scheduled: u64,
    /// Permits handed out.
    pub started: u64,
    /// Work that returned `Ok`.
    pub completed: u64,
    /// Work that returned `Err` or was dropped.
    pub failed: u64,
    /// Rejections of any kind.
    pub rejected: u64,
    /// Rejections at the item ceiling.
    pub rejected_max_pending: u64,
    /// Rejections at the byte ceiling.
    pub rejected_max_pending_bytes: u64,
    /// Starts granted through the starvation rule.
    pub starvation: u64,
    /// Wait of the most recent start.
    pub last_wait_ms: u64,
    /// 95th percentile over the last 64 waits.
    pub wait_p95_ms: u64,
    /// Samples in the wait window.
    pub wait_sample_count: u64,
}

/// Totals across every queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    /// Queued items.
    pub pending: u64,
    /// Queued bytes.
    pub pending_bytes: u64,
    /// Running items.
    pub running: u64,
}

/// Token usage ratio per class, each in `0..=1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UtilizationStats {
    /// Compute usage.
    pub cpu: f64,
    /// I/O usage.
    pub io: f64,
    /// Memory usage.
    pub mem: f64,
    /// Highest of the three.
    pub overall: f64,
}

/// Full scheduler snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    /// Queueing is enabled.
    pub enabled: bool,
    /// `shutdown` has been called.
    pub shutting_down: bool,
    /// Per-queue statistics by name.
    pub queues: BTreeMap<String, QueueStats>,
    /// Global counters.
    pub counters: SchedulerCounters,
    /// Totals across queues.
    pub activity: ActivityStats,
    /// Token usage ratios.
    pub utilization: UtilizationStats,
    /// Token pool state.
    pub tokens: TokenPoolSnapshot,
    /// Write backpressure state.
    pub backpressure: BackpressureState,
    /// Telemetry options in effect.
    pub telemetry: TelemetryOptions,
}

/// Queued work waiting for its permit.
#[derive(Debug)]
struct StartSlot {
    tokens: TokenRequest,
    sender: oneshot::Sender<Result<StartPermit>>,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    pending: AdmissionQueue<StartSlot>,
    running: u64,
    started: u64,
    completed: u64,
    failed: u64,
    starvation: u64,
    last_wait_ms: u64,
    wait_samples: VecDeque<u64>,
    wait_p95_ms: u64,
    last_depth_emit: Option<Instant>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            pending: AdmissionQueue::new(options.limits()),
            running: 0,
            started: 0,
            completed: 0,
            failed: 0,
            starvation: 0,
            last_wait_ms: 0,
            wait_samples: VecDeque::with_capacity(WAIT_SAMPLE_LIMIT),
            wait_p95_ms: 0,
            last_depth_emit: None,
        }
    }

    fn apply_options(&mut self, options: QueueOptions) {
        self.options = QueueOptions {
            weight: options.weight.max(1),
            ..options
        };
        self.pending.set_limits(options.limits());
    }

    fn record_wait(&mut self, waited_ms: u64) {
        self.last_wait_ms = waited_ms;
        if self.wait_samples.len() == WAIT_SAMPLE_LIMIT {
            self.wait_samples.pop_front();
        }
        self.wait_samples.push_back(waited_ms);
        self.wait_p95_ms = percentile_95(&self.wait_samples);
    }

    fn oldest_wait_ms(&self, now: Instant) -> u64 {
        self.pending
            .front()
            .map_or(0, |item| elapsed_ms(item.enqueued_at, now))
    }

    fn stats(&self, now: Instant) -> QueueStats {
        let admission = self.pending.stats();
        let limits = self.pending.limits();
        QueueStats {
            pending: self.pending.len() as u64,
            pending_bytes: self.pending.pending_bytes(),
            running: self.running,
            max_pending: limits.max_pending,
            max_pending_bytes: limits.max_pending_bytes,
            priority: self.options.priority,
            weight: self.options.weight,
            oldest_wait_ms: self.oldest_wait_ms(now),
            scheduled: admission.scheduled,
            started: self.started,
            completed: self.completed,
            failed: self.failed,
            rejected: admission.rejected,
            rejected_max_pending: admission.rejected_max_pending,
            rejected_max_pending_bytes: admission.rejected_max_pending_bytes,
            starvation: self.starvation,
            last_wait_ms: self.last_wait_ms,
            wait_p95_ms: self.wait_p95_ms,
            wait_sample_count: self.wait_samples.len() as u64,
        }
    }
}

fn elapsed_ms(since: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(since).as_millis()).unwrap_or(u64::MAX)
}

fn percentile_95(samples: &VecDeque<u64>) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let rank = (sorted.len() * 95).div_ceil(100);
    sorted
        .get(rank.saturating_sub(1).min(sorted.len() - 1))
        .copied()
        .unwrap_or(0)
}

fn depth_channel(queue: &str) -> String {
    format!("{queue}-queue")
}

struct Pick {
    queue: String,
    index: usize,
    starved: bool,
}

#[derive(Debug)]
struct SchedulerState {
    shutting_down: bool,
    queues: BTreeMap<String, QueueState>,
    counters: SchedulerCounters,
    starvation_ms: u64,
    write_backpressure: WriteBackpressureOptions,
    backpressure: BackpressureState,
    telemetry: TelemetryOptions,
    last_trace: Option<Instant>,
}

impl SchedulerState {
    fn trace_due(&mut self, now: Instant) -> bool {
        let due = self.last_trace.is_none_or(|last| {
            elapsed_ms(last, now) >= self.telemetry.trace_interval_ms
        });
        if due {
            self.last_trace = Some(now);
        }
        due
    }

    fn queue_mut(&mut self, name: &str) -> &mut QueueState {
        self.queues
            .entry(name.to_owned())
            .or_insert_with(|| QueueState::new(QueueOptions::default()))
    }

    fn evaluate_backpressure(&mut self, now: Instant) -> &BackpressureState {
        let options = &self.write_backpressure;
        let next = match self.queues.get(&options.write_queue) {
            Some(queue) if options.enabled => {
                let pending = queue.pending.len() as u64;
                let pending_bytes = queue.pending.pending_bytes();
                let oldest_wait_ms = queue.oldest_wait_ms(now);
                let mut reasons = Vec::new();
                if options.pending_threshold > 0 && pending >= options.pending_threshold {
                    reasons.push(BackpressureReason::Pending);
                }
                if options.pending_bytes_threshold > 0
                    && pending_bytes >= options.pending_bytes_threshold
                {
                    reasons.push(BackpressureReason::PendingBytes);
                }
                if options.oldest_wait_ms_threshold > 0
                    && oldest_wait_ms >= options.oldest_wait_ms_threshold
                {
                    reasons.push(BackpressureReason::OldestWaitMs);
                }
                BackpressureState {
                    active: !reasons.is_empty(),
                    reasons,
                    pending,
                    pending_bytes,
                    oldest_wait_ms,
                }
            },
            _ => BackpressureState::default(),
        };
        if next.active != self.backpressure.active {
            tracing::debug!(
                active = next.active,
                reasons = ?next.reasons,
                "write backpressure changed"
            );
        }
        self.backpressure = next;
        &self.backpressure
    }

    fn producer_blocked(&self, queue: &str) -> bool {
        self.backpressure.active
            && queue != self.write_backpressure.write_queue
            && self.write_backpressure.producer_queues.contains(queue)
    }

    fn pick_next(&self, pool: &TokenPool, now: Instant) -> Option<Pick> {
        let mut order: Vec<(&String, &QueueState)> = self
            .queues
            .iter()
            .filter(|(_, queue)| !queue.pending.is_empty())
            .collect();
        order.sort_by_key(|(name, queue)| (queue.options.priority, *name));

        let mut starving: Option<(Pick, u64)> = None;
        let mut best: Option<(Pick, i64)> = None;
        for (name, queue) in order {
            if self.producer_blocked(name) {
                continue;
            }
            let Some((index, item)) = queue
                .pending
                .iter()
                .enumerate()
                .find(|(_, item)| pool.can_reserve(item.payload.tokens))
            else {
                continue;
            };
            let waited = elapsed_ms(item.enqueued_at, now);
            if waited >= self.starvation_ms {
                if starving.as_ref().is_none_or(|(_, longest)| waited > *longest) {
                    starving = Some((
                        Pick {
                            queue: name.clone(),
                            index,
                            starved: true,
                        },
                        waited,
                    ));
                }
                continue;
            }
            let score = queue_score(queue, waited);
            if best.as_ref().is_none_or(|(_, top)| score > *top) {
                best = Some((
                    Pick {
                        queue: name.clone(),
                        index,
                        starved: false,
                    },
                    score,
                ));
            }
        }
        starving
            .map(|(pick, _)| pick)
            .or_else(|| best.map(|(pick, _)| pick))
    }

    fn depth_snapshot_due(&mut self, name: &str, now: Instant, force: bool) -> Option<PendingSnapshot> {
        if !self.telemetry.queue_depth_snapshots_enabled {
            return None;
        }
        let interval = Duration::from_millis(self.telemetry.queue_depth_snapshot_interval_ms);
        let queue = self.queues.get_mut(name)?;
        let due = force
            || queue
                .last_depth_emit
                .is_none_or(|last| now.saturating_duration_since(last) >= interval);
        if !due {
            return None;
        }
        queue.last_depth_emit = Some(now);
        Some(PendingSnapshot::from_counts(
            queue.pending.len() as u64,
            queue.pending.pending_bytes(),
        ))
    }
}

fn queue_score(queue: &QueueState, waited: u64) -> i64 {
    let waited = i64::try_from(waited).unwrap_or(i64::MAX);
    let weight_boost = i64::from(queue.options.weight.max(1)).saturating_mul(WEIGHT_BOOST_MS);
    let p95 = i64::try_from(queue.wait_p95_ms).unwrap_or(i64::MAX);
    let aging_boost = if p95 > 0 {
        waited.saturating_sub(p95).max(0)
    } else {
        0
    };
    let priority_penalty = i64::from(queue.options.priority.max(0)) * PRIORITY_PENALTY_MS;
    waited
        .saturating_add(weight_boost)
        .saturating_add(aging_boost)
        .saturating_sub(priority_penalty)
}

#[derive(Debug)]
struct SchedulerInner {
    enabled: bool,
    pool: TokenPool,
    telemetry: QueueTelemetry,
    state: Mutex<SchedulerState>,
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_depth(&self, state: &mut SchedulerState, name: &str, now: Instant, force: bool) {
        if let Some(snapshot) = state.depth_snapshot_due(name, now, force) {
            self.telemetry.emit_snapshot(&depth_channel(name), snapshot);
        }
    }

    fn pump(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        loop {
            for queue in state.queues.values_mut() {
                queue.pending.retain(|item| !item.payload.sender.is_closed());
            }
            let now = Instant::now();
            state.evaluate_backpressure(now);
            let Some(pick) = state.pick_next(&self.pool, now) else {
                return;
            };
            let queue = state.queue_mut(&pick.queue);
            let Some(tokens) = queue.pending.iter().nth(pick.index).map(|item| item.payload.tokens)
            else {
                return;
            };
            let Some(grant) = self.pool.try_reserve(tokens) else {
                return;
            };
            let Some(item) = queue.pending.remove(pick.index) else {
                return;
            };
            let waited = elapsed_ms(item.enqueued_at, now);
            let permit = StartPermit {
                scheduler: Arc::clone(self),
                queue: pick.queue.clone(),
                grant: Some(grant),
                succeeded: None,
                armed: true,
            };
            if let Err(Ok(mut unsent)) = item.payload.sender.send(Ok(permit)) {
                unsent.armed = false;
                continue;
            }
            queue.running += 1;
            queue.started += 1;
            queue.record_wait(waited);
            if pick.starved {
                queue.starvation += 1;
            }
            state.counters.started += 1;
            if pick.starved {
                state.counters.starvation += 1;
                tracing::debug!(queue = %pick.queue, waited_ms = waited, "starved queue started");
            }
            self.emit_depth(&mut state, &pick.queue, now, false);
            if state.trace_due(now) {
                let running: u64 = state.queues.values().map(|queue| queue.running).sum();
                let pending: usize = state.queues.values().map(|queue| queue.pending.len()).sum();
                let tokens = self.pool.snapshot();
                tracing::trace!(
                    stage = %state.telemetry.stage,
                    running,
                    pending,
                    started = state.counters.started,
                    cpu_in_use = tokens.cpu.in_use,
                    io_in_use = tokens.io.in_use,
                    mem_in_use = tokens.mem.in_use,
                    "scheduler sample"
                );
            }
        }
    }

    fn finish(&self, queue: &str, succeeded: bool) {
        let mut state = self.lock();
        let entry = state.queue_mut(queue);
        entry.running = entry.running.saturating_sub(1);
        if succeeded {
            entry.completed += 1;
            state.counters.completed += 1;
        } else {
            entry.failed += 1;
            state.counters.failed += 1;
        }
    }

    fn reject_pending(
        &self,
        state: &mut SchedulerState,
        name: &str,
        error: &ErrorEnvelope,
        shutdown: bool,
    ) -> usize {
        let Some(queue) = state.queues.get_mut(name) else {
            return 0;
        };
        let drained = queue.pending.drain();
        let count = drained.len();
        for item in drained {
            queue.pending.record_rejected();
            let _ = item.payload.sender.send(Err(error.clone()));
        }
        let counters = &mut state.counters;
        counters.rejected += count as u64;
        if shutdown {
            counters.rejected_by_reason.shutdown += count as u64;
        } else {
            counters.rejected_by_reason.cleared += count as u64;
        }
        count
    }
}

/// Running slot; releases its tokens and records the outcome when dropped.
#[derive(Debug)]
struct StartPermit {
    scheduler: Arc<SchedulerInner>,
    queue: String,
    grant: Option<TokenGrant>,
    succeeded: Option<bool>,
    armed: bool,
}

impl Drop for StartPermit {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.scheduler
            .finish(&self.queue, self.succeeded.unwrap_or(false));
        drop(self.grant.take());
        self.scheduler.pump();
    }
}

/// Clonable handle to a build scheduler.
#[derive(Debug, Clone)]
pub struct BuildScheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for BuildScheduler {
    fn default() -> Self {
        Self::new(BuildSchedulerOptions::default())
    }
}

impl BuildScheduler {
    /// Scheduler without telemetry.
    #[must_use]
    pub fn new(options: BuildSchedulerOptions) -> Self {
        Self::with_telemetry(options, QueueTelemetry::disabled())
    }

    /// Scheduler publishing queue depths through `telemetry`.
    #[must_use]
    pub fn with_telemetry(options: BuildSchedulerOptions, telemetry: QueueTelemetry) -> Self {
        let queues = options
            .queues
            .iter()
            .map(|(name, queue)| {
                let mut state = QueueState::new(*queue);
                state.apply_options(*queue);
                (name.clone(), state)
            })
            .collect();
        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                enabled: options.enabled,
                pool: TokenPool::new(options.tokens),
                telemetry,
                state: Mutex::new(SchedulerState {
                    shutting_down: false,
                    queues,
                    counters: SchedulerCounters::default(),
                    starvation_ms: options.starvation_ms,
                    write_backpressure: options.write_backpressure,
                    backpressure: BackpressureState::default(),
                    telemetry: TelemetryOptions::default(),
                    last_trace: None,
                }),
            }),
        };
        scheduler.set_telemetry_options(options.telemetry);
        scheduler
    }

    /// Whether work is queued at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Shared token pool, for work that acquires tokens outside any queue.
    #[must_use]
    pub fn token_pool(&self) -> &TokenPool {
        &self.inner.pool
    }

    /// Run `work` on `queue` once admission passes and tokens are reserved.
    ///
    /// # Errors
    ///
    /// Returns the admission rejection, a shutdown or clear rejection, or the
    /// error produced by `work`.
    pub async fn schedule<F, Fut, T>(
        &self,
        queue: &str,
        request: impl Into<ScheduleRequest>,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.inner.enabled {
            return work().await;
        }
        let request = request.into();
        let mut receiver = self.admit(queue, request)?;

        let mut permit = loop {
            let capacity = self.inner.pool.capacity_changed().notified();
            tokio::pin!(capacity);
            capacity.as_mut().enable();
            self.inner.pump();
            tokio::select! {
                biased;
                received = &mut receiver => {
                    break received.map_err(|_| {
                        ErrorEnvelope::cancelled("scheduler dropped queued work")
                    })??;
                },
                () = &mut capacity => {},
            }
        };

        let outcome = work().await;
        permit.succeeded = Some(outcome.is_ok());
        drop(permit);
        outcome
    }

    fn admit(
        &self,
        queue: &str,
        request: ScheduleRequest,
    ) -> Result<oneshot::Receiver<Result<StartPermit>>> {
        let mut state = self.inner.lock();
        if state.shutting_down {
            state.counters.rejected += 1;
            state.counters.rejected_by_reason.shutdown += 1;
            return Err(shutdown_error());
        }
        let (sender, receiver) = oneshot::channel();
        let item = QueueItem::new(
            request.bytes,
            StartSlot {
                tokens: request.tokens,
                sender,
            },
        );
        let state = &mut *state;
        let entry = state
            .queues
            .entry(queue.to_owned())
            .or_insert_with(|| QueueState::new(QueueOptions::default()));
        if let Err(rejection) = try_admit(queue, &mut entry.pending, item, &mut state.counters) {
            tracing::debug!(queue, error = %rejection, "queue admission rejected");
            return Err(rejection.into());
        }
        self.inner.emit_depth(state, queue, Instant::now(), false);
        Ok(receiver)
    }

    /// Create or reconfigure a queue.
    pub fn register_queue(&self, name: &str, options: QueueOptions) {
        self.inner.lock().queue_mut(name).apply_options(options);
        self.inner.pump();
    }

    /// Create or reconfigure several queues.
    pub fn register_queues<'a>(&self, queues: impl IntoIterator<Item = (&'a str, QueueOptions)>) {
        {
            let mut state = self.inner.lock();
            for (name, options) in queues {
                state.queue_mut(name).apply_options(options);
            }
        }
        self.inner.pump();
    }

    /// Reject every pending item of `queue` and return how many were removed.
    pub fn clear_queue(&self, queue: &str, reason: Option<&str>) -> usize {
        let reason = reason.unwrap_or(DEFAULT_CLEAR_REASON);
        let error = ErrorEnvelope::expected(ErrorCode::queue_cleared(), reason)
            .with_metadata("queue", queue);
        let cleared = {
            let mut state = self.inner.lock();
            let cleared = self.inner.reject_pending(&mut state, queue, &error, false);
            self.inner.emit_depth(&mut state, queue, Instant::now(), true);
            cleared
        };
        tracing::debug!(queue, cleared, reason, "queue cleared");
        self.inner.pump();
        cleared
    }

    /// Stop admitting work and reject everything still pending.
    ///
    /// Running work finishes normally.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        let error = shutdown_error();
        let names: Vec<String> = state.queues.keys().cloned().collect();
        let rejected: usize = names
            .iter()
            .map(|name| self.inner.reject_pending(&mut state, name, &error, true))
            .sum();
        tracing::debug!(rejected, "scheduler shut down");
    }

    /// Apply a partial token limit update and re-pump.
    pub fn set_limits(&self, update: &TokenLimitUpdate) -> TokenTotals {
        let totals = self.inner.pool.set_limits(update);
        self.inner.pump();
        totals
    }

    /// Replace the telemetry options (clamped) and sync queue-depth channels.
    pub fn set_telemetry_options(&self, options: TelemetryOptions) {
        let options = options.normalized();
        let mut state = self.inner.lock();
        let was_enabled = state.telemetry.queue_depth_snapshots_enabled;
        let enabled = options.queue_depth_snapshots_enabled;
        if options.stage != state.telemetry.stage {
            tracing::debug!(stage = %options.stage, "scheduler telemetry stage");
        }
        state.telemetry = options;
        if !enabled && !was_enabled {
            return;
        }
        let now = Instant::now();
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            let channel = depth_channel(&name);
            self.inner.telemetry.sync_queue_state(&channel, enabled);
            if enabled {
                self.inner.emit_depth(&mut state, &name, now, true);
            }
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let tokens = self.inner.pool.snapshot();
        let now = Instant::now();
        let mut state = self.inner.lock();
        state.evaluate_backpressure(now);
        let queues: BTreeMap<String, QueueStats> = state
            .queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.stats(now)))
            .collect();
        let activity = queues.values().fold(ActivityStats::default(), |acc, queue| ActivityStats {
            pending: acc.pending + queue.pending,
            pending_bytes: acc.pending_bytes.saturating_add(queue.pending_bytes),
            running: acc.running + queue.running,
        });
        SchedulerStats {
            enabled: self.inner.enabled,
            shutting_down: state.shutting_down,
            queues,
            counters: state.counters,
            activity,
            utilization: utilization(&tokens),
            tokens,
            backpressure: state.backpressure.clone(),
            telemetry: state.telemetry.clone(),
        }
    }
}

fn shutdown_error() -> ErrorEnvelope {
    ErrorEnvelope::expected(ErrorCode::scheduler_shutdown(), "scheduler is shut down")
}

fn utilization(tokens: &TokenPoolSnapshot) -> UtilizationStats {
    let ratio = |class: ResourceClass| {
        let slot = tokens.get(class);
        if slot.total == 0 {
            return 0.0;
        }
        (f64::from(slot.in_use) / f64::from(slot.total)).clamp(0.0, 1.0)
    };
    let cpu = ratio(ResourceClass::Cpu);
    let io = ratio(ResourceClass::Io);
    let mem = ratio(ResourceClass::Memory);
    UtilizationStats {
        cpu,
        io,
        mem,
        overall: cpu.max(io).max(mem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairofcleats_ports::InFlightTelemetryPort;
    use std::error::Error;

    type TestResult = std::result::Result<(), Box<dyn Error>>;

    fn scheduler_with(tokens: TokenTotals) -> BuildScheduler {
        BuildScheduler::new(BuildSchedulerOptions {
            tokens,
            ..BuildSchedulerOptions::default()
        })
    }

    async fn settle_until(scheduler: &BuildScheduler, done: impl Fn(&SchedulerStats) -> bool) {
        for _ in 0..200 {
            if done(&scheduler.stats()) {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Spawn work on `queue` that stays running until the returned sender fires.
    fn spawn_gated(
        scheduler: &BuildScheduler,
        queue: &'static str,
        request: ScheduleRequest,
        log: Arc<Mutex<Vec<&'static str>>>,
    ) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let (open, gate) = oneshot::channel::<()>();
        let scheduler = scheduler.clone();
        let handle = tokio::spawn(async move {
            scheduler
                .schedule(queue, request, move || async move {
                    log.lock().unwrap_or_else(PoisonError::into_inner).push(queue);
                    let _ = gate.await;
                    Ok(())
                })
                .await
        });
        (open, handle)
    }

    fn started(log: &Mutex<Vec<&'static str>>) -> Vec<&'static str> {
        log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn settle_log(log: &Mutex<Vec<&'static str>>, len: usize) {
        for _ in 0..200 {
            if started(log).len() >= len {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn disabled_scheduler_runs_work_directly() -> TestResult {
        let scheduler = BuildScheduler::new(BuildSchedulerOptions {
            enabled: false,
            ..BuildSchedulerOptions::default()
        });
        let value = scheduler
            .schedule("stage1.cpu", TokenRequest::cpu(5), || async { Ok(7) })
            .await?;
        assert_eq!(value, 7);
        assert_eq!(scheduler.stats().counters.scheduled, 0);
        Ok(())
    }

    #[tokio::test]
    async fn completed_and_failed_work_is_counted() -> TestResult {
        let scheduler = scheduler_with(TokenTotals::default());
        scheduler
            .schedule("stage1.cpu", TokenRequest::cpu(1), || async { Ok(()) })
            .await?;
        let failure = scheduler
            .schedule("stage1.cpu", TokenRequest::cpu(1), || async {
                Err::<(), _>(ErrorEnvelope::expected(ErrorCode::io(), "boom"))
            })
            .await;
        assert!(failure.is_err());

        let stats = scheduler.stats();
        let queue = stats
            .queues
            .get("stage1.cpu")
            .ok_or_else(|| std::io::Error::other("queue missing"))?;
        assert_eq!((queue.started, queue.completed, queue.failed), (2, 1, 1));
        assert_eq!(queue.wait_sample_count, 2);
        assert_eq!(stats.counters.scheduled, 2);
        assert_eq!(stats.activity.running, 0);
        assert_eq!(stats.tokens.cpu.in_use, 0);
        Ok(())
    }

    #[tokio::test]
    async fn max_pending_rejects_with_queue_name() -> TestResult {
        let scheduler = scheduler_with(TokenTotals::default());
        scheduler.register_queue(
            "stage1",
            QueueOptions {
                max_pending: Some(1),
                ..QueueOptions::default()
            },
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let (open_running, running) =
            spawn_gated(&scheduler, "stage1", TokenRequest::cpu(1).into(), Arc::clone(&log));
        settle_until(&scheduler, |stats| stats.activity.running == 1).await;
        let (open_pending, pending) =
            spawn_gated(&scheduler, "stage1", TokenRequest::cpu(1).into(), Arc::clone(&log));
        settle_until(&scheduler, |stats| stats.activity.pending == 1).await;

        let rejected = scheduler
            .schedule("stage1", TokenRequest::cpu(1), || async { Ok(()) })
            .await
            .err()
            .ok_or_else(|| std::io::Error::other("expected rejection"))?;
        assert_eq!(rejected.message, "queue stage1 is at maxPending");
        assert_eq!(rejected.code, ErrorCode::queue_max_pending());

        let _ = open_running.send(());
        running.await??;
        let _ = open_pending.send(());
        pending.await??;
        let stats = scheduler.stats();
        assert_eq!(stats.counters.rejected_by_reason.max_pending, 1);
        assert_eq!(stats.counters.completed, 2);
        Ok(())
    }

    #[tokio::test]
    async fn lower_priority_value_starts_first() -> TestResult {
        let scheduler = scheduler_with(TokenTotals::default());
        scheduler.register_queues([
            ("low", QueueOptions { priority: 90, ..QueueOptions::default() }),
            ("high", QueueOptions { priority: 10, ..QueueOptions::default() }),
        ]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let (open_blocker, blocker) =
            spawn_gated(&scheduler, "blocker", TokenRequest::cpu(1).into(), Arc::clone(&log));
        settle_until(&scheduler, |stats| stats.activity.running == 1).await;
        let (open_low, low) = spawn_gated(&scheduler, "low", TokenRequest::cpu(1).into(), Arc::clone(&log));
        let (open_high, high) = spawn_gated(&scheduler, "high", TokenRequest::cpu(1).into(), Arc::clone(&log));
        settle_until(&scheduler, |stats| stats.activity.pending == 2).await;

        let _ = open_blocker.send(());
        blocker.await??;
        settle_log(&log, 2).await;
        assert_eq!(started(&log), vec!["blocker", "high"]);

        let _ = open_high.send(());
        high.await??;
        let _ = open_low.send(());
        low.await??;
        assert_eq!(started(&log), vec!["blocker", "high", "low"]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn starving_queue_wins_over_score() -> TestResult {
        let scheduler = BuildScheduler::new(BuildSchedulerOptions {
            starvation_ms: 100,
            ..BuildSchedulerOptions::default()
        });
        scheduler.register_queues([
            ("bulk", QueueOptions { priority: 100, ..QueueOptions::default() }),
            ("urgent", QueueOptions { priority: 0, weight: 8, ..QueueOptions::default() }),
        ]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let (open_blocker, blocker) =
            spawn_gated(&scheduler, "blocker", TokenRequest::cpu(1).into(), Arc::clone(&log));
        settle_until(&scheduler, |stats| stats.activity.running == 1).await;
        let (open_bulk, bulk) = spawn_gated(&scheduler, "bulk", TokenRequest::cpu(1).into(), Arc::clone(&log));
        settle_until(&scheduler, |stats| stats.activity.pending == 1).await;
        tokio::time::advance(Duration::from_millis(150)).await;
        let (open_urgent, urgent) =
            spawn_gated(&scheduler, "urgent", TokenRequest::cpu(1).into(), Arc::clone(&log));
        settle_until(&scheduler, |stats| stats.activity.pending == 2).await;

        let _ = open_blocker.send(());
        blocker.await??;
        settle_log(&log, 2).await;
        assert_eq!(started(&log), vec!["blocker", "bulk"]);

        let stats = scheduler.stats();
        assert_eq!(stats.counters.starvation, 1);
        assert_eq!(stats.queues.get("bulk").map(|queue| queue.last_wait_ms), Some(150));

        let _ = open_bulk.send(());
        bulk.await??;
        let _ = open_urgent.send(());
        urgent.await??;
        Ok(())
    }

    #[tokio::test]
    async fn write_backlog_pauses_producers() -> TestResult {
        let scheduler = BuildScheduler::new(BuildSchedulerOptions {
            tokens: TokenTotals { cpu: 2, io: 1, mem: 1 },
            write_backpressure: WriteBackpressureOptions {
                pending_threshold: 1,
                ..WriteBackpressureOptions::default()
            },
            ..BuildSchedulerOptions::default()
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        let (open_write, write) = spawn_gated(
            &scheduler,
            queues::STAGE2_WRITE,
            TokenRequest::io(1).into(),
            Arc::clone(&log),
        );
        settle_until(&scheduler, |stats| stats.activity.running == 1).await;
        let (open_queued_write, queued_write) = spawn_gated(
            &scheduler,
            queues::STAGE2_WRITE,
            TokenRequest::io(1).into(),
            Arc::clone(&log),
        );
        let (open_producer, producer) = spawn_gated(
            &scheduler,
            queues::STAGE1_CPU,
            TokenRequest::cpu(1).into(),
            Arc::clone(&log),
        );
        settle_until(&scheduler, |stats| stats.activity.pending == 2).await;

        let stats = scheduler.stats();
        assert!(stats.backpressure.active);
        assert_eq!(stats.backpressure.reasons, vec![BackpressureReason::Pending]);
        assert_eq!(stats.queues.get(queues::STAGE1_CPU).map(|queue| queue.running), Some(0));

        let _ = open_write.send(());
        write.await??;
        settle_until(&scheduler, |stats| stats.activity.running == 2).await;
        let stats = scheduler.stats();
        assert!(!stats.backpressure.active);
        assert_eq!(stats.queues.get(queues::STAGE2_WRITE).map(|queue| queue.started), Some(2));
        assert_eq!(stats.queues.get(queues::STAGE1_CPU).map(|queue| queue.started), Some(1));

        let _ = open_queued_write.send(());
        queued_write.await??;
        let _ = open_producer.send(());
        producer.await??;
        Ok(())
    }

    #[tokio::test]
    async fn raising_limits_starts_pending_work() -> TestResult {
        let scheduler = scheduler_with(TokenTotals::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (open_a, a) = spawn_gated(&scheduler, "stage1.cpu", TokenRequest::cpu(1).into(), Arc::clone(&log));
        let (open_b, b) = spawn_gated(&scheduler, "stage1.cpu", TokenRequest::cpu(1).into(), Arc::clone(&log));
        settle_until(&scheduler, |stats| stats.activity.pending == 1 && stats.activity.running == 1).await;

        let totals = scheduler.set_limits(&TokenLimitUpdate {
            cpu_tokens: Some(2.0),
            ..TokenLimitUpdate::default()
        });
        assert_eq!(totals.cpu, 2);
        settle_until(&scheduler, |stats| stats.activity.running == 2).await;
        let stats = scheduler.stats();
        assert_eq!(stats.activity.running, 2);
        assert!((stats.utilization.cpu - 1.0).abs() < f64::EPSILON);

        let _ = open_a.send(());
        let _ = open_b.send(());
        a.await??;
        b.await??;
        Ok(())
    }

    #[tokio::test]
    async fn clear_and_shutdown_reject_pending_work() -> TestResult {
        let scheduler = scheduler_with(TokenTotals::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (open_running, running) =
            spawn_gated(&scheduler, "stage1.cpu", TokenRequest::cpu(1).into(), Arc::clone(&log));
        let (_open_cleared, cleared) =
            spawn_gated(&scheduler, "stage1.cpu", TokenRequest::cpu(1).into(), Arc::clone(&log));
        settle_until(&scheduler, |stats| stats.activity.pending == 1).await;

        assert_eq!(scheduler.clear_queue("stage1.cpu", Some("restart")), 1);
        let error = cleared.await?.err().ok_or_else(|| std::io::Error::other("expected clear"))?;
        assert_eq!(error.code, ErrorCode::queue_cleared());
        assert_eq!(error.message, "restart");

        let (_open_stopped, stopped) =
            spawn_gated(&scheduler, "stage1.cpu", TokenRequest::cpu(1).into(), Arc::clone(&log));
        settle_until(&scheduler, |stats| stats.activity.pending == 1).await;
        scheduler.shutdown();
        let error = stopped.await?.err().ok_or_else(|| std::io::Error::other("expected shutdown"))?;
        assert_eq!(error.code, ErrorCode::scheduler_shutdown());

        let late = scheduler
            .schedule("stage1.cpu", TokenRequest::cpu(1), || async { Ok(()) })
            .await;
        assert_eq!(late.err().map(|error| error.message), Some("scheduler is shut down".to_owned()));

        let _ = open_running.send(());
        running.await??;
        let stats = scheduler.stats();
        assert!(stats.shutting_down);
        assert_eq!(stats.counters.rejected_by_reason.cleared, 1);
        assert_eq!(stats.counters.rejected_by_reason.shutdown, 2);
        assert_eq!(stats.queues.get("stage1.cpu").map(|queue| queue.rejected), Some(2));
        assert_eq!(stats.counters.completed, 1);
        Ok(())
    }

    #[derive(Default)]
    struct RecordingTelemetry {
        events: Mutex<Vec<(String, Option<(u64, u64)>)>>,
    }

    impl InFlightTelemetryPort for RecordingTelemetry {
        fn set_in_flight_bytes(&self, channel: &str, count: u64, bytes: u64) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((channel.to_owned(), Some((count, bytes))));
        }

        fn clear_in_flight_bytes(&self, channel: &str) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((channel.to_owned(), None));
        }
    }

    #[tokio::test]
    async fn enabling_depth_snapshots_publishes_every_queue() {
        let sink = Arc::new(RecordingTelemetry::default());
        let mut queues_config = BTreeMap::new();
        queues_config.insert(queues::STAGE1_POSTINGS.to_owned(), QueueOptions::default());
        let scheduler = BuildScheduler::with_telemetry(
            BuildSchedulerOptions {
                queues: queues_config,
                ..BuildSchedulerOptions::default()
            },
            QueueTelemetry::new(sink.clone()),
        );
        assert!(sink.events.lock().unwrap_or_else(PoisonError::into_inner).is_empty());

        scheduler.set_telemetry_options(TelemetryOptions {
            queue_depth_snapshots_enabled: true,
            queue_depth_snapshot_interval_ms: 10,
            ..TelemetryOptions::default()
        });
        assert_eq!(scheduler.stats().telemetry.queue_depth_snapshot_interval_ms, 1_000);
        scheduler.set_telemetry_options(TelemetryOptions::default());

        let events = sink.events.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let channel = "stage1.postings-queue".to_owned();
        assert_eq!(
            events,
            vec![
                (channel.clone(), Some((0, 0))),
                (channel.clone(), Some((0, 0))),
                (channel, None),
            ]
        );
    }

    #[test]
    fn trace_samples_respect_the_interval() {
        let scheduler = BuildScheduler::new(BuildSchedulerOptions {
            telemetry: TelemetryOptions {
                trace_interval_ms: 250,
                ..TelemetryOptions::default()
            },
            ..BuildSchedulerOptions::default()
        });
        let start = Instant::now();
        let mut state = scheduler.inner.lock();
        assert!(state.trace_due(start));
        assert!(!state.trace_due(start + Duration::from_millis(249)));
        assert!(state.trace_due(start + Duration::from_millis(250)));
        assert!(!state.trace_due(start + Duration::from_millis(400)));
        assert!(state.trace_due(start + Duration::from_millis(500)));
    }

    #[test]
    fn wait_percentile_uses_ceiling_rank() {
        let samples: VecDeque<u64> = (1..=20).collect();
        assert_eq!(percentile_95(&samples), 19);
        assert_eq!(percentile_95(&VecDeque::from([5])), 5);
        assert_eq!(percentile_95(&VecDeque::new()), 0);
    }

    #[test]
    fn byte_estimates_are_normalized() {
        let request = ScheduleRequest::new(TokenRequest::io(1)).with_byte_estimate(12.9);
        assert_eq!(request.bytes, 12);
        assert_eq!(ScheduleRequest::default().with_byte_estimate(f64::NAN).bytes, 0);
    }
}
