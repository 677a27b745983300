//! Logger, telemetry, and tracing setup for local runs.
//!
//! - `PAIROFCLEATS_LOG_FORMAT=json` enables the structured JSON logger on stderr
//! - `PAIROFCLEATS_LOG_LEVEL` sets its minimum level (`debug|info|warn|error`)
//! - `PAIROFCLEATS_TELEMETRY_FORMAT=json` enables in-flight telemetry events;
//!   when unset it follows the log format
//! - `PAIROFCLEATS_LOG` holds `tracing` filter directives (default `warn`)

use pairofcleats_adapters::{JsonInFlightTelemetry, JsonLogger, LogSink, StderrLogSink};
use pairofcleats_ports::{
    InFlightTelemetryPort, LogLevel, LoggerPort, NoopInFlightTelemetry, NoopLogger,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Env var selecting the log format.
pub const LOG_FORMAT_ENV: &str = "PAIROFCLEATS_LOG_FORMAT";
/// Env var selecting the minimum log level.
pub const LOG_LEVEL_ENV: &str = "PAIROFCLEATS_LOG_LEVEL";
/// Env var selecting the telemetry format.
pub const TELEMETRY_FORMAT_ENV: &str = "PAIROFCLEATS_TELEMETRY_FORMAT";
/// Env var holding `tracing` filter directives.
pub const TRACING_FILTER_ENV: &str = "PAIROFCLEATS_LOG";

const DEFAULT_TRACING_DIRECTIVES: &str = "warn";

/// Logger and telemetry sinks selected from the environment.
#[derive(Clone)]
pub struct Observability {
    /// Structured logger; `None` when JSON logging is off.
    pub logger: Option<Arc<dyn LoggerPort>>,
    /// In-flight telemetry sink; `None` when telemetry is off.
    pub telemetry: Option<Arc<dyn InFlightTelemetryPort>>,
}

impl std::fmt::Debug for Observability {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Observability")
            .field("logger", &self.logger.is_some())
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

impl Observability {
    /// Logger to hand to a build, falling back to a no-op logger.
    #[must_use]
    pub fn logger_or_noop(&self) -> Arc<dyn LoggerPort> {
        self.logger
            .clone()
            .unwrap_or_else(|| Arc::new(NoopLogger))
    }

    /// Telemetry sink to hand to a build, falling back to a no-op sink.
    #[must_use]
    pub fn telemetry_or_noop(&self) -> Arc<dyn InFlightTelemetryPort> {
        self.telemetry
            .clone()
            .unwrap_or_else(|| Arc::new(NoopInFlightTelemetry))
    }
}

/// Select observability sinks from env values, writing to stderr.
#[must_use]
pub fn observability_from_env(env: &BTreeMap<String, String>) -> Observability {
    observability_with_sink(env, Arc::new(StderrLogSink))
}

/// Select observability sinks from env values, writing to `sink`.
#[must_use]
pub fn observability_with_sink(
    env: &BTreeMap<String, String>,
    sink: Arc<dyn LogSink>,
) -> Observability {
    let log_enabled = env_is_json(env, LOG_FORMAT_ENV);
    let telemetry_enabled = env
        .get(TELEMETRY_FORMAT_ENV)
        .map_or(log_enabled, |value| value.trim().eq_ignore_ascii_case("json"));

    let logger: Option<Arc<dyn LoggerPort>> = if log_enabled {
        Some(Arc::new(
            JsonLogger::new(Arc::clone(&sink)).with_min_level(parse_log_level(env)),
        ))
    } else {
        None
    };
    let telemetry: Option<Arc<dyn InFlightTelemetryPort>> = if telemetry_enabled {
        Some(Arc::new(JsonInFlightTelemetry::new(sink)))
    } else {
        None
    };

    Observability { logger, telemetry }
}

fn env_is_json(env: &BTreeMap<String, String>, key: &str) -> bool {
    env.get(key)
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("json"))
}

fn parse_log_level(env: &BTreeMap<String, String>) -> LogLevel {
    let value = env.get(LOG_LEVEL_ENV).map(|value| value.trim().to_ascii_lowercase());
    match value.as_deref() {
        Some("debug") => LogLevel::Debug,
        Some("warn") => LogLevel::Warn,
        Some("error") => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

/// Build the `tracing` filter: `PAIROFCLEATS_LOG`, then `RUST_LOG`, then `warn`.
#[must_use]
pub fn tracing_filter(env: &BTreeMap<String, String>) -> EnvFilter {
    if let Some(directives) = env.get(TRACING_FILTER_ENV)
        && let Ok(filter) = EnvFilter::try_new(directives)
    {
        return filter;
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(DEFAULT_TRACING_DIRECTIVES)
}

/// Install the global `tracing` subscriber writing compact lines to stderr.
///
/// Returns false when a subscriber is already installed.
pub fn init_tracing(env: &BTreeMap<String, String>) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_filter(env))
        .with_writer(std::io::stderr)
        .with_target(true)
        .without_time()
        .compact()
        .try_init()
        .is_ok()
}
