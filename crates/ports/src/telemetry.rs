//! In-flight telemetry boundary contract.
//!
//! Sinks receive `{count, bytes}` snapshots per named channel. They are purely
//! observational and must never influence scheduling.

/// Boundary contract for in-flight byte telemetry.
pub trait InFlightTelemetryPort: Send + Sync {
    /// Publish the current in-flight count and bytes for `channel`.
    fn set_in_flight_bytes(&self, channel: &str, count: u64, bytes: u64);

    /// Remove `channel` from the sink.
    fn clear_in_flight_bytes(&self, channel: &str);
}

/// Sink that ignores every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInFlightTelemetry;

impl InFlightTelemetryPort for NoopInFlightTelemetry {
    fn set_in_flight_bytes(&self, _channel: &str, _count: u64, _bytes: u64) {}

    fn clear_in_flight_bytes(&self, _channel: &str) {}
}
