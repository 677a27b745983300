//! Environment variable parsing and env-to-config merging.
//!
//! Env parsing is strict: a variable that is present but empty or malformed
//! fails fast instead of silently falling back to the file value.

use crate::schema::{SchedulerConfig, ValidatedSchedulerConfig};
use pairofcleats_domain::IndexMode;
use pairofcleats_shared::{ErrorCode, ErrorEnvelope};
use std::collections::BTreeMap;
use std::fmt;

/// Env var: compute token total.
pub const ENV_CPU_TOKENS: &str = "PAIROFCLEATS_CPU_TOKENS";
/// Env var: I/O token total.
pub const ENV_IO_TOKENS: &str = "PAIROFCLEATS_IO_TOKENS";
/// Env var: memory token total.
pub const ENV_MEMORY_TOKENS: &str = "PAIROFCLEATS_MEMORY_TOKENS";
/// Env var: scheduler master switch.
pub const ENV_SCHEDULER: &str = "PAIROFCLEATS_SCHEDULER";
/// Env var: starvation threshold in milliseconds.
pub const ENV_STARVATION_MS: &str = "PAIROFCLEATS_STARVATION_MS";
/// Env var: pipeline overlap master switch.
pub const ENV_PIPELINE_OVERLAP: &str = "PAIROFCLEATS_PIPELINE_OVERLAP";
/// Env var: ordered completion stall poll in milliseconds.
pub const ENV_STALL_POLL_MS: &str = "PAIROFCLEATS_STALL_POLL_MS";
/// Env var: ordered completion timeout in milliseconds.
pub const ENV_ORDERED_TIMEOUT_MS: &str = "PAIROFCLEATS_ORDERED_TIMEOUT_MS";
/// Env var: index mode.
pub const ENV_INDEX_MODE: &str = "PAIROFCLEATS_INDEX_MODE";
/// Env var: incremental bundle updates.
pub const ENV_INCREMENTAL: &str = "PAIROFCLEATS_INCREMENTAL";
/// Env var: queue-depth snapshot publishing.
pub const ENV_QUEUE_DEPTH_SNAPSHOTS: &str = "PAIROFCLEATS_QUEUE_DEPTH_SNAPSHOTS";

const ALL_ENV_VARS: [&str; 11] = [
    ENV_CPU_TOKENS,
    ENV_IO_TOKENS,
    ENV_MEMORY_TOKENS,
    ENV_SCHEDULER,
    ENV_STARVATION_MS,
    ENV_PIPELINE_OVERLAP,
    ENV_STALL_POLL_MS,
    ENV_ORDERED_TIMEOUT_MS,
    ENV_INDEX_MODE,
    ENV_INCREMENTAL,
    ENV_QUEUE_DEPTH_SNAPSHOTS,
];

/// Parsed env overrides; `None` leaves the file/default value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerEnv {
    /// Override for `cpuTokens`.
    pub cpu_tokens: Option<u32>,
    /// Override for `ioTokens`.
    pub io_tokens: Option<u32>,
    /// Override for `memoryTokens`.
    pub memory_tokens: Option<u32>,
    /// Override for `enabled`.
    pub enabled: Option<bool>,
    /// Override for `starvationMs`.
    pub starvation_ms: Option<u64>,
    /// Override for `pipelineOverlap.enabled`.
    pub pipeline_overlap: Option<bool>,
    /// Override for `orderedCompletion.stallPollMs`.
    pub stall_poll_ms: Option<u64>,
    /// Override for `orderedCompletion.timeoutMs`.
    pub ordered_timeout_ms: Option<u64>,
    /// Override for `indexing.mode`.
    pub index_mode: Option<IndexMode>,
    /// Override for `indexing.incremental`.
    pub incremental: Option<bool>,
    /// Override for `telemetry.queueDepthSnapshotsEnabled`.
    pub queue_depth_snapshots: Option<bool>,
}

impl SchedulerEnv {
    /// Parse env overrides from a key/value map (useful for tests and fixtures).
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, EnvParseError> {
        Ok(Self {
            cpu_tokens: parse_optional_u32(map, ENV_CPU_TOKENS)?,
            io_tokens: parse_optional_u32(map, ENV_IO_TOKENS)?,
            memory_tokens: parse_optional_u32(map, ENV_MEMORY_TOKENS)?,
            enabled: parse_optional_bool(map, ENV_SCHEDULER)?,
            starvation_ms: parse_optional_u64(map, ENV_STARVATION_MS)?,
            pipeline_overlap: parse_optional_bool(map, ENV_PIPELINE_OVERLAP)?,
            stall_poll_ms: parse_optional_u64(map, ENV_STALL_POLL_MS)?,
            ordered_timeout_ms: parse_optional_u64(map, ENV_ORDERED_TIMEOUT_MS)?,
            index_mode: parse_optional_index_mode(map, ENV_INDEX_MODE)?,
            incremental: parse_optional_bool(map, ENV_INCREMENTAL)?,
            queue_depth_snapshots: parse_optional_bool(map, ENV_QUEUE_DEPTH_SNAPSHOTS)?,
        })
    }

    /// Parse env overrides from the current process environment.
    pub fn from_std_env() -> Result<Self, EnvParseError> {
        let map: BTreeMap<String, String> = ALL_ENV_VARS
            .iter()
            .filter_map(|name| {
                std::env::var(name)
                    .ok()
                    .map(|value| ((*name).to_owned(), value))
            })
            .collect();
        Self::from_map(&map)
    }

    /// Returns true when no override is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Apply env overrides to a base config (env wins over file/default values).
pub fn apply_env_overrides(
    base: SchedulerConfig,
    env: &SchedulerEnv,
) -> Result<ValidatedSchedulerConfig, ErrorEnvelope> {
    let mut config = base;
    set_tokens(&mut config.cpu_tokens, env.cpu_tokens);
    set_tokens(&mut config.io_tokens, env.io_tokens);
    set_tokens(&mut config.memory_tokens, env.memory_tokens);
    set(&mut config.enabled, env.enabled);
    set(&mut config.starvation_ms, env.starvation_ms);
    set(&mut config.pipeline_overlap.enabled, env.pipeline_overlap);
    set(
        &mut config.ordered_completion.stall_poll_ms,
        env.stall_poll_ms,
    );
    set(
        &mut config.ordered_completion.timeout_ms,
        env.ordered_timeout_ms,
    );
    set(&mut config.indexing.mode, env.index_mode);
    set(&mut config.indexing.incremental, env.incremental);
    set(
        &mut config.telemetry.queue_depth_snapshots_enabled,
        env.queue_depth_snapshots,
    );

    config.validate_and_normalize().map_err(Into::into)
}

fn set<T: Copy>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

fn set_tokens(field: &mut f64, value: Option<u32>) {
    if let Some(value) = value {
        *field = f64::from(value);
    }
}

/// Typed env parsing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvParseError {
    /// An env var was present but empty after trimming.
    EmptyValue {
        /// Env var name.
        var: &'static str,
    },
    /// Boolean env var had an invalid value.
    InvalidBool {
        /// Env var name.
        var: &'static str,
        /// Raw input value.
        value: String,
    },
    /// Integer env var had an invalid value.
    InvalidInt {
        /// Env var name.
        var: &'static str,
        /// Raw input value.
        value: String,
    },
    /// Enum env var had an invalid value.
    InvalidEnum {
        /// Env var name.
        var: &'static str,
        /// Raw input value.
        value: String,
    },
}

impl EnvParseError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::EmptyValue { .. } => ErrorCode::new("config", "empty_env_var"),
            Self::InvalidBool { .. } => ErrorCode::new("config", "invalid_env_bool"),
            Self::InvalidInt { .. } => ErrorCode::new("config", "invalid_env_int"),
            Self::InvalidEnum { .. } => ErrorCode::new("config", "invalid_env_enum"),
        }
    }
}

impl fmt::Display for EnvParseError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyValue { var } => write!(formatter, "{var} must be non-empty"),
            Self::InvalidBool { var, .. } => write!(formatter, "{var} must be a boolean"),
            Self::InvalidInt { var, .. } => write!(formatter, "{var} must be an integer"),
            Self::InvalidEnum { var, .. } => write!(formatter, "{var} has an unsupported value"),
        }
    }
}

impl std::error::Error for EnvParseError {}

impl From<EnvParseError> for ErrorEnvelope {
    fn from(error: EnvParseError) -> Self {
        let code = error.error_code();
        let message = error.to_string();
        let envelope = Self::expected(code, message);

        match error {
            EnvParseError::EmptyValue { var } => envelope.with_metadata("env_var", var),
            EnvParseError::InvalidBool { var, value }
            | EnvParseError::InvalidInt { var, value }
            | EnvParseError::InvalidEnum { var, value } => envelope
                .with_metadata("env_var", var)
                .with_metadata("value", value),
        }
    }
}

fn non_empty<'a>(
    map: &'a BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<(&'a str, &'a String)>, EnvParseError> {
    let Some(raw) = map.get(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EnvParseError::EmptyValue { var });
    }
    Ok(Some((trimmed, raw)))
}

fn parse_optional_u64(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<u64>, EnvParseError> {
    let Some((trimmed, raw)) = non_empty(map, var)? else {
        return Ok(None);
    };
    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|_| EnvParseError::InvalidInt {
            var,
            value: raw.clone(),
        })
}

fn parse_optional_u32(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<u32>, EnvParseError> {
    let Some((trimmed, raw)) = non_empty(map, var)? else {
        return Ok(None);
    };
    trimmed
        .parse::<u32>()
        .map(Some)
        .map_err(|_| EnvParseError::InvalidInt {
            var,
            value: raw.clone(),
        })
}

fn parse_optional_bool(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<bool>, EnvParseError> {
    let Some((trimmed, raw)) = non_empty(map, var)? else {
        return Ok(None);
    };
    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(EnvParseError::InvalidBool {
            var,
            value: raw.clone(),
        }),
    }
}

fn parse_optional_index_mode(
    map: &BTreeMap<String, String>,
    var: &'static str,
) -> Result<Option<IndexMode>, EnvParseError> {
    let Some((trimmed, raw)) = non_empty(map, var)? else {
        return Ok(None);
    };
    trimmed
        .parse::<IndexMode>()
        .map(Some)
        .map_err(|_| EnvParseError::InvalidEnum {
            var,
            value: raw.clone(),
        })
}
