//! Domain primitives with validated constructors.

use crate::LineSpan;
use pairofcleats_shared::{ErrorCode, ErrorEnvelope};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Well-known scheduler queue names used by the build pipeline.
pub mod queues {
    /// Per-file processing (parse, chunk, tokenize).
    pub const STAGE1_CPU: &str = "stage1.cpu";
    /// Per-file reads.
    pub const STAGE1_IO: &str = "stage1.io";
    /// Postings construction.
    pub const STAGE1_POSTINGS: &str = "stage1.postings";
    /// Cross-file relations and import graph.
    pub const STAGE2_RELATIONS: &str = "stage2.relations";
    /// Relation-side reads.
    pub const STAGE2_RELATIONS_IO: &str = "stage2.relations.io";
    /// Artifact writes.
    pub const STAGE2_WRITE: &str = "stage2.write";

    /// Queues that feed the write queue and pause under write backpressure.
    pub const WRITE_PRODUCERS: [&str; 5] = [
        STAGE1_CPU,
        STAGE1_IO,
        STAGE1_POSTINGS,
        STAGE2_RELATIONS,
        STAGE2_RELATIONS_IO,
    ];
}

/// Well-known in-flight telemetry channels.
pub mod channels {
    /// Artifact write queue.
    pub const ARTIFACTS_WRITE: &str = "artifacts.write";
    /// Postings construction backlog.
    pub const STAGE1_POSTINGS_QUEUE: &str = "stage1.postings-queue";
}

/// Validation failures for domain primitives and spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveError {
    /// `QueueName` is empty after trimming.
    EmptyQueueName {
        /// Length of the raw input before trimming.
        input_length: usize,
    },
    /// `ChannelName` is empty after trimming.
    EmptyChannelName {
        /// Length of the raw input before trimming.
        input_length: usize,
    },
    /// `ChunkId` is empty after trimming.
    InvalidChunkId {
        /// Length of the raw input before trimming.
        input_length: usize,
    },
    /// Unknown index mode label.
    UnknownIndexMode {
        /// Trimmed input that failed to parse.
        input: String,
    },
    /// Unknown resource class label.
    UnknownResourceClass {
        /// Trimmed input that failed to parse.
        input: String,
    },
    /// `LineSpan` start/end must be >= 1.
    LineSpanNonPositive {
        /// Starting line (1-indexed).
        start_line: u32,
        /// Ending line (1-indexed).
        end_line: u32,
    },
    /// `LineSpan` start must be <= end.
    LineSpanStartAfterEnd {
        /// Starting line (1-indexed).
        start_line: u32,
        /// Ending line (1-indexed).
        end_line: u32,
    },
    /// Derived chunk id is invalid (invariant violation).
    DerivedChunkIdInvalid {
        /// Candidate chunk id that failed validation.
        candidate: String,
    },
}

impl PrimitiveError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::EmptyQueueName { .. } => ErrorCode::new("domain", "invalid_queue_name"),
            Self::EmptyChannelName { .. } => ErrorCode::new("domain", "invalid_channel_name"),
            Self::InvalidChunkId { .. } | Self::DerivedChunkIdInvalid { .. } => {
                ErrorCode::new("domain", "invalid_chunk_id")
            },
            Self::UnknownIndexMode { .. } => ErrorCode::new("domain", "unknown_index_mode"),
            Self::UnknownResourceClass { .. } => {
                ErrorCode::new("domain", "unknown_resource_class")
            },
            Self::LineSpanNonPositive { .. } | Self::LineSpanStartAfterEnd { .. } => {
                ErrorCode::new("domain", "invalid_line_span")
            },
        }
    }

    const fn is_invariant(&self) -> bool {
        matches!(self, Self::DerivedChunkIdInvalid { .. })
    }
}

impl fmt::Display for PrimitiveError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyQueueName { .. } => formatter.write_str("QueueName must be non-empty"),
            Self::EmptyChannelName { .. } => formatter.write_str("ChannelName must be non-empty"),
            Self::InvalidChunkId { .. } => formatter.write_str("ChunkId must be non-empty"),
            Self::UnknownIndexMode { input } => write!(
                formatter,
                "unknown index mode `{input}` (expected code, prose, extracted-prose or records)"
            ),
            Self::UnknownResourceClass { input } => write!(
                formatter,
                "unknown resource class `{input}` (expected cpu, io or mem)"
            ),
            Self::LineSpanNonPositive { .. } => {
                formatter.write_str("LineSpan start_line/end_line must be >= 1")
            },
            Self::LineSpanStartAfterEnd { .. } => {
                formatter.write_str("LineSpan start_line must be <= end_line")
            },
            Self::DerivedChunkIdInvalid { .. } => {
                formatter.write_str("Derived chunk id is invalid (this is a bug).")
            },
        }
    }
}

impl std::error::Error for PrimitiveError {}

impl From<PrimitiveError> for ErrorEnvelope {
    fn from(error: PrimitiveError) -> Self {
        let mut envelope = if error.is_invariant() {
            Self::invariant(error.error_code(), error.to_string())
        } else {
            Self::expected(error.error_code(), error.to_string())
        };

        match error {
            PrimitiveError::EmptyQueueName { input_length }
            | PrimitiveError::EmptyChannelName { input_length }
            | PrimitiveError::InvalidChunkId { input_length } => {
                envelope = envelope.with_metadata("input_length", input_length.to_string());
            },
            PrimitiveError::UnknownIndexMode { input }
            | PrimitiveError::UnknownResourceClass { input } => {
                envelope = envelope.with_metadata("input", input);
            },
            PrimitiveError::LineSpanNonPositive {
                start_line,
                end_line,
            }
            | PrimitiveError::LineSpanStartAfterEnd {
                start_line,
                end_line,
            } => {
                envelope = envelope
                    .with_metadata("start_line", start_line.to_string())
                    .with_metadata("end_line", end_line.to_string());
            },
            PrimitiveError::DerivedChunkIdInvalid { candidate } => {
                envelope = envelope.with_metadata("candidate", candidate);
            },
        }

        envelope
    }
}

macro_rules! trimmed_name {
    ($(#[$meta:meta])* $name:ident, $error:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Box<str>);

        impl $name {
            /// Parse from user input; the value is trimmed and must be non-empty.
            pub fn parse(input: impl AsRef<str>) -> Result<Self, PrimitiveError> {
                let raw = input.as_ref();
                let Some(trimmed) = trimmed_non_empty(raw) else {
                    return Err(PrimitiveError::$error {
                        input_length: raw.len(),
                    });
                };

                Ok(Self(trimmed.to_owned().into_boxed_str()))
            }

            /// Access the underlying string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(self.as_str())
            }
        }
    };
}

trimmed_name!(
    /// Name of a scheduler queue, e.g. `stage1.cpu`.
    QueueName,
    EmptyQueueName
);

trimmed_name!(
    /// Name of an in-flight telemetry channel, e.g. `artifacts.write`.
    ChannelName,
    EmptyChannelName
);

trimmed_name!(
    /// Identifier for a content chunk.
    ChunkId,
    InvalidChunkId
);

/// Derive a deterministic chunk identifier from its file and span.
pub fn derive_chunk_id(relative_path: &str, span: LineSpan) -> Result<ChunkId, PrimitiveError> {
    let mut hasher = Sha256::new();
    hasher.update(relative_path.as_bytes());
    hasher.update(b":");
    hasher.update(span.start_line().to_string().as_bytes());
    hasher.update(b":");
    hasher.update(span.end_line().to_string().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    let candidate = format!("chunk_{hex}");

    ChunkId::parse(candidate.as_str()).map_err(|_| PrimitiveError::DerivedChunkIdInvalid { candidate })
}

/// Corpus an index build targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IndexMode {
    /// Source code; the only mode with cross-file inference.
    #[default]
    Code,
    /// Free-form documentation.
    Prose,
    /// Prose extracted from code comments.
    ExtractedProse,
    /// Structured records.
    Records,
}

impl IndexMode {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Prose => "prose",
            Self::ExtractedProse => "extracted-prose",
            Self::Records => "records",
        }
    }

    /// Returns true for the code corpus.
    #[must_use]
    pub const fn is_code(self) -> bool {
        matches!(self, Self::Code)
    }
}

impl fmt::Display for IndexMode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for IndexMode {
    type Err = PrimitiveError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "code" => Ok(Self::Code),
            "prose" => Ok(Self::Prose),
            "extracted-prose" | "extracted_prose" => Ok(Self::ExtractedProse),
            "records" => Ok(Self::Records),
            other => Err(PrimitiveError::UnknownIndexMode {
                input: other.to_owned(),
            }),
        }
    }
}

/// Resource class a scheduler token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    /// Compute tokens (`cpu`).
    Cpu,
    /// I/O tokens (`io`).
    Io,
    /// Memory tokens (`mem`).
    #[serde(rename = "mem")]
    Memory,
}

impl ResourceClass {
    /// All classes in stable order.
    pub const ALL: [Self; 3] = [Self::Cpu, Self::Io, Self::Memory];

    /// Short label used in token requests and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Io => "io",
            Self::Memory => "mem",
        }
    }

    /// Config key holding this class's total.
    #[must_use]
    pub const fn limit_key(self) -> &'static str {
        match self {
            Self::Cpu => "cpuTokens",
            Self::Io => "ioTokens",
            Self::Memory => "memoryTokens",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = PrimitiveError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "cpu" | "compute" => Ok(Self::Cpu),
            "io" => Ok(Self::Io),
            "mem" | "memory" => Ok(Self::Memory),
            other => Err(PrimitiveError::UnknownResourceClass {
                input: other.to_owned(),
            }),
        }
    }
}

fn trimmed_non_empty(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn queue_name_requires_non_empty_input() {
        let error = QueueName::parse("   ").err();
        assert!(matches!(
            error,
            Some(PrimitiveError::EmptyQueueName { input_length: 3 })
        ));
    }

    #[test]
    fn index_mode_parses_aliases() {
        assert_eq!("extracted_prose".parse::<IndexMode>(), Ok(IndexMode::ExtractedProse));
        assert_eq!(" CODE ".parse::<IndexMode>(), Ok(IndexMode::Code));
        assert!("vectors".parse::<IndexMode>().is_err());
    }

    #[test]
    fn resource_class_labels_match_config_keys() {
        assert_eq!(ResourceClass::Memory.as_str(), "mem");
        assert_eq!(ResourceClass::Memory.limit_key(), "memoryTokens");
        assert_eq!("compute".parse::<ResourceClass>(), Ok(ResourceClass::Cpu));
    }

    #[test]
    fn derive_chunk_id_is_deterministic() -> Result<(), PrimitiveError> {
        let span = LineSpan::new(1, 4)?;
        let first = derive_chunk_id("src/lib.rs", span)?;
        let second = derive_chunk_id("src/lib.rs", span)?;
        let other = derive_chunk_id("src/main.rs", span)?;

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.as_str().starts_with("chunk_"));
        Ok(())
    }

    #[test]
    fn write_producers_exclude_write_queue() {
        assert!(!queues::WRITE_PRODUCERS.contains(&queues::STAGE2_WRITE));
    }

    proptest! {
        #[test]
        fn queue_name_accepts_dotted_names(name in dotted_queue_name()) {
            let parsed = QueueName::parse(&name);
            prop_assert!(parsed.is_ok());
            prop_assert_eq!(parsed.map(|q| q.as_str().to_owned()).ok(), Some(name));
        }
    }

    fn dotted_queue_name() -> impl Strategy<Value = String> {
        let segment = prop::collection::vec(prop::sample::select(('a'..='z').collect::<Vec<_>>()), 1..8)
            .prop_map(|chars| chars.into_iter().collect::<String>());
        prop::collection::vec(segment, 1..4).prop_map(|segments| segments.join("."))
    }
}
