//! Queue and write telemetry projection.
//!
//! Everything here is observational: snapshots go to an injected
//! [`InFlightTelemetryPort`] and progress lines go to a [`LoggerPort`]; neither
//! feeds back into scheduling.

use crate::admission::normalize_byte_count;
use pairofcleats_ports::{InFlightTelemetryPort, LoggerPort, log_fields};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Lower bound for the trace interval.
pub const TRACE_INTERVAL_MIN_MS: u64 = 100;
/// Lower bound for the queue-depth snapshot interval.
pub const QUEUE_DEPTH_SNAPSHOT_INTERVAL_MIN_MS: u64 = 1_000;

/// Scheduler telemetry options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryOptions {
    /// Stage label attached to telemetry.
    pub stage: String,
    /// Publish queue depths to the in-flight sink.
    pub queue_depth_snapshots_enabled: bool,
    /// Minimum spacing between scheduler trace samples.
    pub trace_interval_ms: u64,
    /// Minimum spacing between depth snapshots of one queue.
    pub queue_depth_snapshot_interval_ms: u64,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            stage: "init".to_owned(),
            queue_depth_snapshots_enabled: false,
            trace_interval_ms: 1_000,
            queue_depth_snapshot_interval_ms: 5_000,
        }
    }
}

impl TelemetryOptions {
    /// Clamp intervals to their minimums and default a blank stage.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let stage = self.stage.trim();
        self.stage = if stage.is_empty() {
            "init".to_owned()
        } else {
            stage.to_owned()
        };
        self.trace_interval_ms = self.trace_interval_ms.max(TRACE_INTERVAL_MIN_MS);
        self.queue_depth_snapshot_interval_ms = self
            .queue_depth_snapshot_interval_ms
            .max(QUEUE_DEPTH_SNAPSHOT_INTERVAL_MIN_MS);
        self
    }
}

/// Raw pending figures as reported by a producer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PendingSnapshot {
    /// Items in flight.
    pub pending_count: f64,
    /// Bytes in flight.
    pub pending_bytes: f64,
}

impl PendingSnapshot {
    /// Snapshot from integral counts.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "telemetry figures tolerate rounding above 2^53"
    )]
    pub const fn from_counts(count: u64, bytes: u64) -> Self {
        Self {
            pending_count: count as f64,
            pending_bytes: bytes as f64,
        }
    }
}

/// Publishes sanitized `{count, bytes}` pairs on named channels.
#[derive(Clone, Default)]
pub struct QueueTelemetry {
    sink: Option<Arc<dyn InFlightTelemetryPort>>,
}

impl std::fmt::Debug for QueueTelemetry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("QueueTelemetry")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl QueueTelemetry {
    /// Projection writing to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn InFlightTelemetryPort>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Projection without a sink; every call is a no-op.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { sink: None }
    }

    /// Publish a snapshot; negative or non-finite figures are reported as 0.
    pub fn emit_snapshot(&self, channel: &str, snapshot: PendingSnapshot) {
        let Some(sink) = &self.sink else {
            return;
        };
        sink.set_in_flight_bytes(
            channel,
            normalize_byte_count(snapshot.pending_count),
            normalize_byte_count(snapshot.pending_bytes),
        );
    }

    /// Seed zeros on `channel` when enabled, clear it otherwise.
    pub fn sync_queue_state(&self, channel: &str, enabled: bool) {
        let Some(sink) = &self.sink else {
            return;
        };
        if enabled {
            sink.set_in_flight_bytes(channel, 0, 0);
        } else {
            sink.clear_in_flight_bytes(channel);
        }
    }
}

/// Age of the oldest in-flight item in whole seconds (rounded), or 0.
#[must_use]
pub fn longest_in_flight_age(active: impl IntoIterator<Item = Instant>, now: Instant) -> u64 {
    active
        .into_iter()
        .map(|started| now.saturating_duration_since(started))
        .max()
        .map_or(0, rounded_seconds)
}

fn rounded_seconds(age: Duration) -> u64 {
    let millis = u64::try_from(age.as_millis()).unwrap_or(u64::MAX);
    millis.saturating_add(500) / 1_000
}

/// Format a progress line: `<label> <completed>/<total> (<pct>%) | <last>`.
#[must_use]
#[expect(
    clippy::cast_precision_loss,
    reason = "percentages only need one decimal place"
)]
pub fn format_progress_line(label: &str, completed: u64, total: u64, last: &str) -> String {
    let pct = if total == 0 {
        100.0
    } else {
        (completed as f64 / total as f64) * 100.0
    };
    format!("{label} {completed}/{total} ({pct:.1}%) | {last}")
}

#[derive(Debug, Default)]
struct ProgressState {
    completed: u64,
    last_emit: Option<Instant>,
}

/// Throttled progress reporter for artifact writes.
///
/// Emits on the first item, on the last item, and otherwise at most once per
/// interval.
pub struct WriteProgress {
    label: String,
    total: u64,
    interval: Duration,
    logger: Arc<dyn LoggerPort>,
    state: Mutex<ProgressState>,
}

impl std::fmt::Debug for WriteProgress {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("WriteProgress")
            .field("label", &self.label)
            .field("total", &self.total)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl WriteProgress {
    /// Reporter for `total` items.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        total: u64,
        interval: Duration,
        logger: Arc<dyn LoggerPort>,
    ) -> Self {
        Self {
            label: label.into(),
            total,
            interval,
            logger,
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Items completed so far.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completed
    }

    /// Record one completed item; returns the line when one was emitted.
    pub fn record(&self, item_label: &str) -> Option<String> {
        let now = Instant::now();
        let completed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.completed += 1;
            let due = state
                .last_emit
                .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
            let boundary = state.completed == 1 || state.completed >= self.total;
            if !(due || boundary) {
                return None;
            }
            state.last_emit = Some(now);
            state.completed
        };

        let line = format_progress_line(&self.label, completed, self.total, item_label);
        self.logger.info(
            "status.line",
            &line,
            Some(log_fields([
                ("completed", json!(completed)),
                ("total", json!(self.total)),
            ])),
        );
        Some(line)
    }
}
