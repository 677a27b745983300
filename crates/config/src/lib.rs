//! # pairofcleats-config
//!
//! Scheduler configuration schema, env overrides, layered loading, and
//! normalization. This crate depends on `domain` and `shared` only.

/// JSON Schema export.
pub mod config_schema;
/// Environment variable parsing and merging.
pub mod env;
/// Config loading helpers (env + file + overrides).
pub mod load;
/// Configuration schema types and helpers.
pub mod schema;

pub use config_schema::scheduler_config_schema;
pub use env::{EnvParseError, SchedulerEnv, apply_env_overrides};
pub use load::{
    ConfigFormat, detect_config_format, load_scheduler_config_from_path,
    load_scheduler_config_from_sources, load_scheduler_config_std_env, to_pretty_json,
    to_pretty_toml,
};
pub use schema::{
    CURRENT_CONFIG_VERSION, ConfigSchemaError, IndexingConfig, OrderedCompletionConfig,
    PipelineOverlapConfig, QUEUE_DEPTH_SNAPSHOT_INTERVAL_MIN_MS, QueueConfig, SchedulerConfig,
    TRACE_INTERVAL_MIN_MS, TelemetryConfig, TokenTotalsConfig, ValidatedSchedulerConfig,
    WriteBackpressureConfig, WriteProgressConfig, parse_scheduler_config_json,
    parse_scheduler_config_toml,
};

/// Returns the config crate version.
#[must_use]
pub const fn config_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
