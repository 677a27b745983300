//! In-flight telemetry adapters.

use crate::log_sink::LogSink;
use crate::logger::now_epoch_ms;
use pairofcleats_ports::InFlightTelemetryPort;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Writes one JSON line per in-flight update.
#[derive(Clone)]
pub struct JsonInFlightTelemetry {
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for JsonInFlightTelemetry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("JsonInFlightTelemetry").finish_non_exhaustive()
    }
}

impl JsonInFlightTelemetry {
    /// Telemetry writing to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    fn write(&self, payload: &serde_json::Value) {
        if let Ok(mut line) = serde_json::to_string(payload) {
            line.push('\n');
            self.sink.write_line(&line);
        }
    }
}

impl InFlightTelemetryPort for JsonInFlightTelemetry {
    fn set_in_flight_bytes(&self, channel: &str, count: u64, bytes: u64) {
        self.write(&json!({
            "type": "inflight",
            "timestampMs": now_epoch_ms(),
            "channel": channel,
            "count": count,
            "bytes": bytes,
        }));
    }

    fn clear_in_flight_bytes(&self, channel: &str) {
        self.write(&json!({
            "type": "inflight.clear",
            "timestampMs": now_epoch_ms(),
            "channel": channel,
        }));
    }
}

/// Last published value of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InFlightValue {
    /// Items in flight.
    pub count: u64,
    /// Bytes in flight.
    pub bytes: u64,
}

/// One recorded update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InFlightEvent {
    /// `set_in_flight_bytes` call.
    Set {
        /// Channel name.
        channel: String,
        /// Published value.
        value: InFlightValue,
    },
    /// `clear_in_flight_bytes` call.
    Clear {
        /// Channel name.
        channel: String,
    },
}

#[derive(Debug, Default)]
struct MemoryState {
    channels: BTreeMap<String, InFlightValue>,
    history: Vec<InFlightEvent>,
}

/// Keeps the last value per channel plus the full update history.
#[derive(Debug, Default)]
pub struct MemoryInFlightTelemetry {
    state: Mutex<MemoryState>,
}

impl MemoryInFlightTelemetry {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value of `channel`, if it is currently published.
    #[must_use]
    pub fn get(&self, channel: &str) -> Option<InFlightValue> {
        self.lock().channels.get(channel).copied()
    }

    /// Every published channel and its last value.
    #[must_use]
    pub fn channels(&self) -> BTreeMap<String, InFlightValue> {
        self.lock().channels.clone()
    }

    /// Updates in arrival order.
    #[must_use]
    pub fn history(&self) -> Vec<InFlightEvent> {
        self.lock().history.clone()
    }

    /// Largest byte value ever published on `channel`.
    #[must_use]
    pub fn peak_bytes(&self, channel: &str) -> u64 {
        self.lock()
            .history
            .iter()
            .filter_map(|event| match event {
                InFlightEvent::Set { channel: name, value } if name == channel => Some(value.bytes),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InFlightTelemetryPort for MemoryInFlightTelemetry {
    fn set_in_flight_bytes(&self, channel: &str, count: u64, bytes: u64) {
        let value = InFlightValue { count, bytes };
        let mut state = self.lock();
        state.channels.insert(channel.to_owned(), value);
        state.history.push(InFlightEvent::Set {
            channel: channel.to_owned(),
            value,
        });
    }

    fn clear_in_flight_bytes(&self, channel: &str) {
        let mut state = self.lock();
        state.channels.remove(channel);
        state.history.push(InFlightEvent::Clear {
            channel: channel.to_owned(),
        });
    }
}
