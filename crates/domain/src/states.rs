//! Outcome states reported by a build.

use pairofcleats_shared::ErrorEnvelope;
use serde::{Deserialize, Serialize};

/// How a speculatively started stage was settled at its join point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapResolution {
    /// The static condition was false; the stage ran at its join point.
    NotStarted,
    /// The early result was consumed.
    Joined,
    /// The early result was discarded and the fallback ran.
    Discarded,
}

impl OverlapResolution {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Joined => "joined",
            Self::Discarded => "discarded",
        }
    }
}

/// Terminal status of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildStatus {
    /// All artifacts were written.
    Completed,
    /// The build stopped at the first failure.
    Failed {
        /// First failure observed, in settlement order.
        error: ErrorEnvelope,
        /// Operations still in flight when the failure surfaced.
        pending: usize,
    },
}

impl BuildStatus {
    /// Human-readable one-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Completed => "completed".to_owned(),
            Self::Failed { error, pending } => {
                format!("failed: {} ({pending} pending)", error.message)
            },
        }
    }
}
