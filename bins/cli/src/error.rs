//! CLI error and exit code types.

use pairofcleats_shared::{ErrorEnvelope, ErrorKind};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok = 0,
    Internal = 1,
    InvalidInput = 2,
    Io = 3,
    BuildFailed = 4,
    Cancelled = 130,
}

impl ExitCode {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Exit code for an error surfaced by the infra layer.
    #[must_use]
    pub fn for_envelope(error: &ErrorEnvelope) -> Self {
        if error.is_cancelled() {
            return Self::Cancelled;
        }
        match error.kind {
            ErrorKind::Expected => Self::InvalidInput,
            ErrorKind::Invariant | ErrorKind::Unexpected => Self::Internal,
        }
    }
}

#[derive(Debug)]
pub enum CliError {
    #[allow(dead_code, reason = "variant kept for input-validation errors; not yet constructed")]
    InvalidInput(String),
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl CliError {
    #[must_use]
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::InvalidInput(_) => ExitCode::InvalidInput,
            Self::Io(_) => ExitCode::Io,
            Self::Serialization(_) => ExitCode::Internal,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(message) => write!(formatter, "invalid input: {message}"),
            Self::Io(error) => write!(formatter, "io error: {error}"),
            Self::Serialization(error) => write!(formatter, "serialization error: {error}"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<std::io::Error> for CliError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairofcleats_shared::{ErrorClass, ErrorCode};

    #[test]
    fn envelope_kinds_map_to_exit_codes() {
        let expected = ErrorEnvelope::expected(ErrorCode::invalid_input(), "bad flag");
        let unexpected = ErrorEnvelope::unexpected(
            ErrorCode::internal(),
            "disk vanished",
            ErrorClass::NonRetriable,
        );
        let cancelled = ErrorEnvelope::cancelled("stopped");

        assert_eq!(ExitCode::for_envelope(&expected), ExitCode::InvalidInput);
        assert_eq!(ExitCode::for_envelope(&unexpected), ExitCode::Internal);
        assert_eq!(ExitCode::for_envelope(&cancelled), ExitCode::Cancelled);
    }

    #[test]
    fn aborted_drains_exit_as_cancelled() {
        let aborted =
            ErrorEnvelope::expected(ErrorCode::ordered_completion_aborted(), "drain aborted");
        let timed_out =
            ErrorEnvelope::expected(ErrorCode::ordered_completion_timeout(), "drain timed out");

        assert_eq!(ExitCode::for_envelope(&aborted), ExitCode::Cancelled);
        assert_eq!(ExitCode::for_envelope(&aborted).as_u8(), 130);
        assert_eq!(ExitCode::for_envelope(&timed_out), ExitCode::InvalidInput);
    }
}
