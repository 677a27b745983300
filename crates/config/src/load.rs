//! Config loading helpers (env + file + overrides).
//!
//! The loader owns the merge order and surfaces user-facing errors as typed
//! `ErrorEnvelope`s.

use crate::{
    IndexingConfig, QueueConfig, SchedulerConfig, SchedulerEnv, ValidatedSchedulerConfig,
    apply_env_overrides,
};
use pairofcleats_domain::IndexMode;
use pairofcleats_shared::{ErrorClass, ErrorCode, ErrorEnvelope};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Serialized config formats accepted by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.json` (also used when the path has no extension).
    Json,
    /// `.toml`.
    Toml,
}

/// Load the scheduler config from in-memory sources.
///
/// Precedence (highest wins):
/// - env overrides (`SchedulerEnv`)
/// - overrides JSON (partial config)
/// - config JSON (file content)
/// - defaults (`SchedulerConfig::default()`)
pub fn load_scheduler_config_from_sources(
    config_json: Option<&str>,
    overrides_json: Option<&str>,
    env: &SchedulerEnv,
) -> Result<ValidatedSchedulerConfig, ErrorEnvelope> {
    let config = match config_json {
        None => SchedulerConfig::default(),
        Some(input) => parse_config_unvalidated(input, ConfigFormat::Json)?,
    };
    merge_and_validate(config, overrides_json, env)
}

/// Load the scheduler config from an optional file path.
pub fn load_scheduler_config_from_path(
    config_path: Option<&Path>,
    overrides_json: Option<&str>,
    env: &SchedulerEnv,
) -> Result<ValidatedSchedulerConfig, ErrorEnvelope> {
    let config = match config_path {
        None => SchedulerConfig::default(),
        Some(path) => {
            let format = detect_config_format(path)?;
            let config_text = read_config_file(path)?;
            parse_config_unvalidated(&config_text, format)?
        },
    };
    merge_and_validate(config, overrides_json, env)
}

/// Load the scheduler config from the process env and an optional file path.
pub fn load_scheduler_config_std_env(
    config_path: Option<&Path>,
    overrides_json: Option<&str>,
) -> Result<ValidatedSchedulerConfig, ErrorEnvelope> {
    let env = SchedulerEnv::from_std_env().map_err(ErrorEnvelope::from)?;
    load_scheduler_config_from_path(config_path, overrides_json, &env)
}

/// Serialize the config as pretty JSON (with trailing newline).
pub fn to_pretty_json(config: &SchedulerConfig) -> Result<String, ErrorEnvelope> {
    let mut output = serde_json::to_string_pretty(config).map_err(|error| {
        ErrorEnvelope::unexpected(
            ErrorCode::internal(),
            format!("failed to serialize config: {error}"),
            ErrorClass::NonRetriable,
        )
    })?;
    output.push('\n');
    Ok(output)
}

/// Serialize the config as pretty TOML (with trailing newline).
pub fn to_pretty_toml(config: &SchedulerConfig) -> Result<String, ErrorEnvelope> {
    let mut output = toml::to_string_pretty(config).map_err(|error| {
        ErrorEnvelope::unexpected(
            ErrorCode::new("config", "serialize_toml"),
            format!("failed to serialize config TOML: {error}"),
            ErrorClass::NonRetriable,
        )
    })?;
    output.push('\n');
    Ok(output)
}

/// Pick the config format from a file extension.
pub fn detect_config_format(path: &Path) -> Result<ConfigFormat, ErrorEnvelope> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        None | Some("json") => Ok(ConfigFormat::Json),
        Some("toml") => Ok(ConfigFormat::Toml),
        Some(other) => Err(ErrorEnvelope::expected(
            ErrorCode::new("config", "unsupported_format"),
            "unsupported config format; use .json or .toml",
        )
        .with_metadata("extension", other.to_owned())),
    }
}

fn merge_and_validate(
    mut config: SchedulerConfig,
    overrides_json: Option<&str>,
    env: &SchedulerEnv,
) -> Result<ValidatedSchedulerConfig, ErrorEnvelope> {
    if let Some(input) = overrides_json {
        let overrides = parse_overrides_json(input)?;
        overrides.apply(&mut config);
    }

    // env is applied last and also validates the merged config.
    apply_env_overrides(config, env)
}

fn parse_config_unvalidated(
    input: &str,
    format: ConfigFormat,
) -> Result<SchedulerConfig, ErrorEnvelope> {
    match format {
        ConfigFormat::Json => serde_json::from_str(input).map_err(|error| {
            ErrorEnvelope::expected(
                ErrorCode::new("config", "invalid_json"),
                format!("invalid config JSON: {error}"),
            )
            .with_metadata("source", "config")
        }),
        ConfigFormat::Toml => toml::from_str(input).map_err(|error| {
            ErrorEnvelope::expected(
                ErrorCode::new("config", "invalid_toml"),
                format!("invalid config TOML: {error}"),
            )
            .with_metadata("source", "config")
        }),
    }
}

fn parse_overrides_json(input: &str) -> Result<SchedulerConfigOverrides, ErrorEnvelope> {
    serde_json::from_str(input).map_err(|error| {
        ErrorEnvelope::expected(
            ErrorCode::new("config", "invalid_json"),
            format!("invalid overrides JSON: {error}"),
        )
        .with_metadata("source", "overrides")
    })
}

fn read_config_file(path: &Path) -> Result<String, ErrorEnvelope> {
    std::fs::read_to_string(path).map_err(|error| {
        let code = match error.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::new("config", "config_file_not_found"),
            std::io::ErrorKind::PermissionDenied => {
                ErrorCode::new("config", "config_file_permission_denied")
            },
            _ => ErrorCode::new("config", "config_file_io"),
        };

        ErrorEnvelope::expected(code, format!("failed to read config file: {error}"))
            .with_metadata("path", path.to_string_lossy().to_string())
    })
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct SchedulerConfigOverrides {
    version: Option<u32>,
    enabled: Option<bool>,
    cpu_tokens: Option<f64>,
    io_tokens: Option<f64>,
    memory_tokens: Option<f64>,
    starvation_ms: Option<u64>,
    queues: BTreeMap<String, QueueConfig>,
    write_backpressure: WriteBackpressureOverrides,
    telemetry: TelemetryOverrides,
    ordered_completion: OrderedCompletionOverrides,
    pipeline_overlap: PipelineOverlapOverrides,
    indexing: IndexingOverrides,
    write_progress: WriteProgressOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct WriteBackpressureOverrides {
    enabled: Option<bool>,
    write_queue: Option<String>,
    producer_queues: Option<Vec<String>>,
    pending_threshold: Option<u64>,
    pending_bytes_threshold: Option<u64>,
    oldest_wait_ms_threshold: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct TelemetryOverrides {
    stage: Option<String>,
    queue_depth_snapshots_enabled: Option<bool>,
    trace_interval_ms: Option<u64>,
    queue_depth_snapshot_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct OrderedCompletionOverrides {
    stall_poll_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct PipelineOverlapOverrides {
    enabled: Option<bool>,
    infer_postings: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct IndexingOverrides {
    mode: Option<IndexMode>,
    cross_file_inference: Option<bool>,
    import_graph: Option<bool>,
    incremental: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct WriteProgressOverrides {
    log_interval_ms: Option<u64>,
    label: Option<String>,
}

fn set<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

impl SchedulerConfigOverrides {
    fn apply(self, config: &mut SchedulerConfig) {
        set(&mut config.version, self.version);
        set(&mut config.enabled, self.enabled);
        set(&mut config.cpu_tokens, self.cpu_tokens);
        set(&mut config.io_tokens, self.io_tokens);
        set(&mut config.memory_tokens, self.memory_tokens);
        set(&mut config.starvation_ms, self.starvation_ms);
        // queue entries merge by name; a listed queue replaces the file entry.
        config.queues.extend(self.queues);

        let backpressure = &mut config.write_backpressure;
        let overrides = self.write_backpressure;
        set(&mut backpressure.enabled, overrides.enabled);
        set(&mut backpressure.write_queue, overrides.write_queue);
        set(&mut backpressure.producer_queues, overrides.producer_queues);
        set(&mut backpressure.pending_threshold, overrides.pending_threshold);
        set(
            &mut backpressure.pending_bytes_threshold,
            overrides.pending_bytes_threshold,
        );
        set(
            &mut backpressure.oldest_wait_ms_threshold,
            overrides.oldest_wait_ms_threshold,
        );

        let telemetry = &mut config.telemetry;
        set(&mut telemetry.stage, self.telemetry.stage);
        set(
            &mut telemetry.queue_depth_snapshots_enabled,
            self.telemetry.queue_depth_snapshots_enabled,
        );
        set(
            &mut telemetry.trace_interval_ms,
            self.telemetry.trace_interval_ms,
        );
        set(
            &mut telemetry.queue_depth_snapshot_interval_ms,
            self.telemetry.queue_depth_snapshot_interval_ms,
        );

        set(
            &mut config.ordered_completion.stall_poll_ms,
            self.ordered_completion.stall_poll_ms,
        );
        set(
            &mut config.ordered_completion.timeout_ms,
            self.ordered_completion.timeout_ms,
        );
        set(
            &mut config.pipeline_overlap.enabled,
            self.pipeline_overlap.enabled,
        );
        set(
            &mut config.pipeline_overlap.infer_postings,
            self.pipeline_overlap.infer_postings,
        );
        apply_indexing(&mut config.indexing, self.indexing);
        set(
            &mut config.write_progress.log_interval_ms,
            self.write_progress.log_interval_ms,
        );
        set(&mut config.write_progress.label, self.write_progress.label);
    }
}

fn apply_indexing(indexing: &mut IndexingConfig, overrides: IndexingOverrides) {
    set(&mut indexing.mode, overrides.mode);
    set(
        &mut indexing.cross_file_inference,
        overrides.cross_file_inference,
    );
    set(&mut indexing.import_graph, overrides.import_graph);
    set(&mut indexing.incremental, overrides.incremental);
}
