//! Scheduler configuration schema, defaults, validation, and normalization.
//!
//! - Deserialization uses `serde` (JSON or TOML).
//! - Validation is manual and returns typed errors mapped to `ErrorEnvelope`.
//! - Normalization clamps soft limits instead of rejecting them.

use pairofcleats_domain::{IndexMode, queues};
use pairofcleats_shared::{ErrorCode, ErrorEnvelope};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current supported configuration schema version.
pub const CURRENT_CONFIG_VERSION: u32 = 1;

const TOKENS_MIN: u64 = 1;
const TOKENS_MAX: u64 = 1_024;
const STARVATION_MIN_MS: u64 = 1;
const STARVATION_MAX_MS: u64 = 3_600_000;
const ORDERED_TIMEOUT_MAX_MS: u64 = 86_400_000;
const STALL_POLL_MAX_MS: u64 = 600_000;
const PROGRESS_INTERVAL_MAX_MS: u64 = 600_000;
const QUEUES_MAX: usize = 64;
const PRODUCER_QUEUES_MAX: usize = 64;

/// Minimum trace interval; smaller values are raised to this.
pub const TRACE_INTERVAL_MIN_MS: u64 = 100;
/// Minimum queue-depth snapshot interval; smaller values are raised to this.
pub const QUEUE_DEPTH_SNAPSHOT_INTERVAL_MIN_MS: u64 = 1_000;

/// Top-level scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SchedulerConfig {
    /// Schema version for forward-compatible migrations.
    pub version: u32,
    /// When false, scheduled work runs immediately without admission or tokens.
    pub enabled: bool,
    /// Compute token total.
    pub cpu_tokens: f64,
    /// I/O token total.
    pub io_tokens: f64,
    /// Memory token total.
    pub memory_tokens: f64,
    /// Wait after which a queue head is considered starving.
    pub starvation_ms: u64,
    /// Per-queue admission and fairness settings.
    pub queues: BTreeMap<String, QueueConfig>,
    /// Producer throttling while the write queue is backed up.
    pub write_backpressure: WriteBackpressureConfig,
    /// Queue telemetry options.
    pub telemetry: TelemetryConfig,
    /// Drain-wait options for ordered completion.
    pub ordered_completion: OrderedCompletionConfig,
    /// Speculative stage overlap toggles.
    pub pipeline_overlap: PipelineOverlapConfig,
    /// Indexing feature flags that gate overlap.
    pub indexing: IndexingConfig,
    /// Write progress logging.
    pub write_progress: WriteProgressConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            version: CURRENT_CONFIG_VERSION,
            enabled: true,
            cpu_tokens: 1.0,
            io_tokens: 1.0,
            memory_tokens: 1.0,
            starvation_ms: 30_000,
            queues: BTreeMap::new(),
            write_backpressure: WriteBackpressureConfig::default(),
            telemetry: TelemetryConfig::default(),
            ordered_completion: OrderedCompletionConfig::default(),
            pipeline_overlap: PipelineOverlapConfig::default(),
            indexing: IndexingConfig::default(),
            write_progress: WriteProgressConfig::default(),
        }
    }
}

/// Admission ceilings and fairness weights for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct QueueConfig {
    /// Lower values are preferred on ties and score higher.
    pub priority: i32,
    /// Fairness weight (>= 1).
    pub weight: u32,
    /// Maximum queued items; `None` is unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<u64>,
    /// Maximum queued bytes; `None` is unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending_bytes: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority: 50,
            weight: 1,
            max_pending: None,
            max_pending_bytes: None,
        }
    }
}

impl QueueConfig {
    /// Clamp weight and `maxPending` to 1, and treat a zero byte ceiling as unbounded.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.weight = self.weight.max(1);
        self.max_pending = self.max_pending.map(|value| value.max(1));
        self.max_pending_bytes = self.max_pending_bytes.filter(|value| *value > 0);
        self
    }
}

/// Write-queue thresholds that pause producer queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct WriteBackpressureConfig {
    /// Enable producer throttling.
    pub enabled: bool,
    /// Queue whose backlog is watched.
    pub write_queue: String,
    /// Queues paused while backpressure is active.
    pub producer_queues: Vec<String>,
    /// Pending item count that activates backpressure.
    pub pending_threshold: u64,
    /// Pending byte count that activates backpressure.
    pub pending_bytes_threshold: u64,
    /// Oldest pending wait that activates backpressure.
    pub oldest_wait_ms_threshold: u64,
}

impl Default for WriteBackpressureConfig {
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

/// Queue telemetry options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct TelemetryConfig {
    /// Stage label attached to telemetry.
    pub stage: String,
    /// Publish queue depths to the in-flight telemetry sink.
    pub queue_depth_snapshots_enabled: bool,
    /// Minimum spacing between scheduler trace samples (clamped to >= 100).
    pub trace_interval_ms: u64,
    /// Queue-depth snapshot interval (clamped to >= 1000).
    pub queue_depth_snapshot_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            stage: "init".to_owned(),
            queue_depth_snapshots_enabled: false,
            trace_interval_ms: 1_000,
            queue_depth_snapshot_interval_ms: 5_000,
        }
    }
}

/// Drain-wait options for ordered completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct OrderedCompletionConfig {
    /// Stall callback period; 0 disables stall reporting.
    pub stall_poll_ms: u64,
    /// Drain deadline; 0 waits forever.
    pub timeout_ms: u64,
}

/// Speculative stage overlap toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PipelineOverlapConfig {
    /// Master switch.
    pub enabled: bool,
    /// Start postings construction before relations finish.
    pub infer_postings: bool,
}

impl Default for PipelineOverlapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            infer_postings: true,
        }
    }
}

/// Indexing feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct IndexingConfig {
    /// Corpus to build.
    #[schemars(with = "String")]
    pub mode: IndexMode,
    /// Cross-file type and usage inference.
    pub cross_file_inference: bool,
    /// Import graph construction.
    pub import_graph: bool,
    /// Incremental bundle updates.
    pub incremental: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            mode: IndexMode::Code,
            cross_file_inference: true,
            import_graph: true,
            incremental: false,
        }
    }
}

/// Write progress logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct WriteProgressConfig {
    /// Minimum time between progress lines.
    pub log_interval_ms: u64,
    /// Progress line label.
    pub label: String,
}

impl Default for WriteProgressConfig {
    fn default() -> Self {
        Self {
            log_interval_ms: 1_000,
            label: "Writing index files".to_owned(),
        }
    }
}

impl SchedulerConfig {
    /// Validate and normalize the config.
    pub fn validate_and_normalize(
        mut self,
    ) -> Result<ValidatedSchedulerConfig, ConfigSchemaError> {
        self.validate_version()?;
        let tokens = TokenTotalsConfig {
            cpu: validate_tokens("cpuTokens", self.cpu_tokens)?,
            io: validate_tokens("ioTokens", self.io_tokens)?,
            memory: validate_tokens("memoryTokens", self.memory_tokens)?,
        };
        self.cpu_tokens = f64::from(tokens.cpu);
        self.io_tokens = f64::from(tokens.io);
        self.memory_tokens = f64::from(tokens.memory);

        check_range(
            "scheduler",
            "starvationMs",
            self.starvation_ms,
            STARVATION_MIN_MS,
            STARVATION_MAX_MS,
        )?;
        self.normalize_queues()?;
        self.normalize_backpressure()?;
        self.telemetry.normalize();
        check_range(
            "orderedCompletion",
            "timeoutMs",
            self.ordered_completion.timeout_ms,
            0,
            ORDERED_TIMEOUT_MAX_MS,
        )?;
        check_range(
            "orderedCompletion",
            "stallPollMs",
            self.ordered_completion.stall_poll_ms,
            0,
            STALL_POLL_MAX_MS,
        )?;
        check_range(
            "writeProgress",
            "logIntervalMs",
            self.write_progress.log_interval_ms,
            0,
            PROGRESS_INTERVAL_MAX_MS,
        )?;
        let label = self.write_progress.label.trim();
        if label.is_empty() {
            return Err(ConfigSchemaError::EmptyField {
                section: "writeProgress",
                field: "label",
            });
        }
        self.write_progress.label = label.to_owned();

        Ok(ValidatedSchedulerConfig { raw: self, tokens })
    }

    const fn validate_version(&self) -> Result<(), ConfigSchemaError> {
        if self.version != CURRENT_CONFIG_VERSION {
            return Err(ConfigSchemaError::UnsupportedVersion {
                found: self.version,
                supported: CURRENT_CONFIG_VERSION,
            });
        }
        Ok(())
    }

    fn normalize_queues(&mut self) -> Result<(), ConfigSchemaError> {
        if self.queues.len() > QUEUES_MAX {
            return Err(ConfigSchemaError::ListTooLarge {
                section: "scheduler",
                field: "queues",
                len: self.queues.len(),
                max: QUEUES_MAX,
            });
        }
        let mut normalized = BTreeMap::new();
        for (name, queue) in std::mem::take(&mut self.queues) {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                return Err(ConfigSchemaError::InvalidQueueName { name });
            }
            normalized.insert(trimmed.to_owned(), queue.normalized());
        }
        self.queues = normalized;
        Ok(())
    }

    fn normalize_backpressure(&mut self) -> Result<(), ConfigSchemaError> {
        let config = &mut self.write_backpressure;
        let write_queue = config.write_queue.trim();
        if write_queue.is_empty() {
            return Err(ConfigSchemaError::InvalidQueueName {
                name: config.write_queue.clone(),
            });
        }
        config.write_queue = write_queue.to_owned();

        let mut producers = Vec::with_capacity(config.producer_queues.len());
        for name in &config.producer_queues {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                return Err(ConfigSchemaError::InvalidQueueName { name: name.clone() });
            }
            producers.push(trimmed.to_owned());
        }
        producers.sort();
        producers.dedup();
        if producers.len() > PRODUCER_QUEUES_MAX {
            return Err(ConfigSchemaError::ListTooLarge {
                section: "writeBackpressure",
                field: "producerQueues",
                len: producers.len(),
                max: PRODUCER_QUEUES_MAX,
            });
        }
        config.producer_queues = producers;
        config.pending_threshold = config.pending_threshold.max(1);
        config.pending_bytes_threshold = config.pending_bytes_threshold.max(1);
        config.oldest_wait_ms_threshold = config.oldest_wait_ms_threshold.max(1);
        Ok(())
    }
}

impl TelemetryConfig {
    fn normalize(&mut self) {
        let stage = self.stage.trim();
        self.stage = if stage.is_empty() {
            Self::default().stage
        } else {
            stage.to_owned()
        };
        self.trace_interval_ms = self.trace_interval_ms.max(TRACE_INTERVAL_MIN_MS);
        self.queue_depth_snapshot_interval_ms = self
            .queue_depth_snapshot_interval_ms
            .max(QUEUE_DEPTH_SNAPSHOT_INTERVAL_MIN_MS);
    }
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "value is finite and range-checked before the cast"
)]
fn validate_tokens(field: &'static str, value: f64) -> Result<u32, ConfigSchemaError> {
    if !value.is_finite() {
        return Err(ConfigSchemaError::NonFiniteTokens { field });
    }
    let floored = value.floor();
    if floored < TOKENS_MIN as f64 || floored > TOKENS_MAX as f64 {
        return Err(ConfigSchemaError::LimitOutOfRange {
            section: "scheduler",
            field,
            value: floored.max(0.0) as u64,
            min: TOKENS_MIN,
            max: TOKENS_MAX,
        });
    }
    Ok(floored as u32)
}

const fn check_range(
    section: &'static str,
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
) -> Result<(), ConfigSchemaError> {
    if value < min || value > max {
        return Err(ConfigSchemaError::LimitOutOfRange {
            section,
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Token totals after flooring and range checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenTotalsConfig {
    /// Compute tokens.
    pub cpu: u32,
    /// I/O tokens.
    pub io: u32,
    /// Memory tokens.
    pub memory: u32,
}

/// Validated config wrapper carrying integral token totals.
#[derive(Debug, Clone)]
pub struct ValidatedSchedulerConfig {
    raw: SchedulerConfig,
    tokens: TokenTotalsConfig,
}

impl ValidatedSchedulerConfig {
    /// Validated token totals.
    #[must_use]
    pub const fn tokens(&self) -> TokenTotalsConfig {
        self.tokens
    }

    /// Borrow the raw config.
    #[must_use]
    pub const fn as_ref(&self) -> &SchedulerConfig {
        &self.raw
    }

    /// Consume the wrapper and return the raw config.
    #[must_use]
    pub fn into_inner(self) -> SchedulerConfig {
        self.raw
    }
}

impl AsRef<SchedulerConfig> for ValidatedSchedulerConfig {
    fn as_ref(&self) -> &SchedulerConfig {
        &self.raw
    }
}

impl std::ops::Deref for ValidatedSchedulerConfig {
    type Target = SchedulerConfig;

    fn deref(&self) -> &Self::Target {
        &self.raw
    }
}

/// Parse a scheduler config from a JSON string, applying validation and normalization.
pub fn parse_scheduler_config_json(
    input: &str,
) -> Result<ValidatedSchedulerConfig, ErrorEnvelope> {
    let config: SchedulerConfig = serde_json::from_str(input).map_err(|error| {
        ErrorEnvelope::expected(
            ErrorCode::new("config", "invalid_json"),
            format!("invalid config JSON: {error}"),
        )
    })?;

    config.validate_and_normalize().map_err(Into::into)
}

/// Parse a scheduler config from a TOML string, applying validation and normalization.
pub fn parse_scheduler_config_toml(
    input: &str,
) -> Result<ValidatedSchedulerConfig, ErrorEnvelope> {
    let config: SchedulerConfig = toml::from_str(input).map_err(|error| {
        ErrorEnvelope::expected(
            ErrorCode::new("config", "invalid_toml"),
            format!("invalid config TOML: {error}"),
        )
    })?;

    config.validate_and_normalize().map_err(Into::into)
}

/// Typed config validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSchemaError {
    /// The config version is not supported by this binary.
    UnsupportedVersion {
        /// Version found in the config.
        found: u32,
        /// Version supported by this crate.
        supported: u32,
    },
    /// A token total is NaN or infinite.
    NonFiniteTokens {
        /// Field name (e.g. `cpuTokens`).
        field: &'static str,
    },
    /// A numeric limit is out of bounds.
    LimitOutOfRange {
        /// Schema section (e.g. `scheduler`).
        section: &'static str,
        /// Field name in the config file (e.g. `starvationMs`).
        field: &'static str,
        /// Value provided.
        value: u64,
        /// Minimum allowed value.
        min: u64,
        /// Maximum allowed value.
        max: u64,
    },
    /// A list or map exceeds the maximum allowed size.
    ListTooLarge {
        /// Schema section.
        section: &'static str,
        /// Field name.
        field: &'static str,
        /// Number of entries.
        len: usize,
        /// Maximum allowed number of entries.
        max: usize,
    },
    /// A queue name is empty after trimming.
    InvalidQueueName {
        /// Raw name.
        name: String,
    },
    /// A required string field is empty after trimming.
    EmptyField {
        /// Schema section.
        section: &'static str,
        /// Field name.
        field: &'static str,
    },
}

impl ConfigSchemaError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedVersion { .. } => ErrorCode::new("config", "unsupported_version"),
            Self::NonFiniteTokens { .. } | Self::LimitOutOfRange { .. } => {
                ErrorCode::new("config", "invalid_limit")
            },
            Self::ListTooLarge { .. } => ErrorCode::new("config", "list_too_large"),
            Self::InvalidQueueName { .. } => ErrorCode::new("config", "invalid_queue_name"),
            Self::EmptyField { .. } => ErrorCode::new("config", "empty_field"),
        }
    }
}

impl fmt::Display for ConfigSchemaError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion { found, supported } => write!(
                formatter,
                "unsupported config version: {found} (supported: {supported})"
            ),
            Self::NonFiniteTokens { field } => {
                write!(formatter, "scheduler.{field} must be a finite number")
            },
            Self::LimitOutOfRange {
                section,
                field,
                value,
                min,
                max,
            } => write!(
                formatter,
                "{section}.{field} must be within [{min}, {max}] (got {value})"
            ),
            Self::ListTooLarge {
                section,
                field,
                len,
                max,
            } => write!(
                formatter,
                "{section}.{field} must have at most {max} entries (got {len})"
            ),
            Self::InvalidQueueName { name } => {
                write!(formatter, "queue name must be non-empty (got {name:?})")
            },
            Self::EmptyField { section, field } => {
                write!(formatter, "{section}.{field} must be non-empty")
            },
        }
    }
}

impl std::error::Error for ConfigSchemaError {}

impl From<ConfigSchemaError> for ErrorEnvelope {
    fn from(error: ConfigSchemaError) -> Self {
        let code = error.error_code();
        let message = error.to_string();
        let mut envelope = Self::expected(code, message);

        match error {
            ConfigSchemaError::UnsupportedVersion { found, supported } => {
                envelope = envelope
                    .with_metadata("found", found.to_string())
                    .with_metadata("supported", supported.to_string());
            },
            ConfigSchemaError::NonFiniteTokens { field } => {
                envelope = envelope
                    .with_metadata("section", "scheduler")
                    .with_metadata("field", field);
            },
            ConfigSchemaError::LimitOutOfRange {
                section,
                field,
                value,
                min,
                max,
            } => {
                envelope = envelope
                    .with_metadata("section", section)
                    .with_metadata("field", field)
                    .with_metadata("value", value.to_string())
                    .with_metadata("min", min.to_string())
                    .with_metadata("max", max.to_string());
            },
            ConfigSchemaError::ListTooLarge {
                section,
                field,
                len,
                max,
            } => {
                envelope = envelope
                    .with_metadata("section", section)
                    .with_metadata("field", field)
                    .with_metadata("len", len.to_string())
                    .with_metadata("max", max.to_string());
            },
            ConfigSchemaError::InvalidQueueName { name } => {
                envelope = envelope.with_metadata("name", name);
            },
            ConfigSchemaError::EmptyField { section, field } => {
                envelope = envelope
                    .with_metadata("section", section)
                    .with_metadata("field", field);
            },
        }

        envelope
    }
}
