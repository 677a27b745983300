//! Error envelope shared by every crate in the workspace.
//!
//! Codes are namespaced. Scheduler admission and lifecycle failures live in
//! [`SCHEDULER_NAMESPACE`]; drain failures of ordered completion tracking
//! live in [`ORDERED_COMPLETION_NAMESPACE`] and flatten to identifiers such as
//! `ORDERED_COMPLETION_TIMEOUT`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fmt, io};

/// Diagnostic key/value pairs attached to an envelope.
pub type ErrorMetadata = BTreeMap<String, String>;

/// Namespace for scheduler admission and lifecycle failures.
pub const SCHEDULER_NAMESPACE: &str = "scheduler";

/// Namespace for ordered-completion drain failures.
pub const ORDERED_COMPLETION_NAMESPACE: &str = "ORDERED_COMPLETION";

const CORE_NAMESPACE: &str = "core";

/// Where a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Validation, user input, cancellation, admission rejection.
    Expected,
    /// A broken internal contract.
    Invariant,
    /// I/O and everything else nobody planned for.
    Unexpected,
}

impl ErrorKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Expected => "expected",
            Self::Invariant => "invariant",
            Self::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Whether a caller may try the same work again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Retrying can succeed (queue pressure, transient I/O).
    Retriable,
    /// Retrying repeats the failure.
    NonRetriable,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Retriable => "retriable",
            Self::NonRetriable => "non-retriable",
        })
    }
}

/// Stable `namespace:code` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode {
    namespace: String,
    code: String,
}

impl ErrorCode {
    /// Code in an arbitrary namespace.
    pub fn new(namespace: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            code: code.into(),
        }
    }

    /// Caller cancelled the operation.
    pub fn cancelled() -> Self {
        Self::new(CORE_NAMESPACE, "cancelled")
    }

    /// Input failed validation.
    pub fn invalid_input() -> Self {
        Self::new(CORE_NAMESPACE, "invalid_input")
    }

    /// Generic I/O failure.
    pub fn io() -> Self {
        Self::new(CORE_NAMESPACE, "io")
    }

    /// Internal failure.
    pub fn internal() -> Self {
        Self::new(CORE_NAMESPACE, "internal")
    }

    /// Queue rejected an item because its pending count is at the ceiling.
    pub fn queue_max_pending() -> Self {
        Self::new(SCHEDULER_NAMESPACE, "queue_max_pending")
    }

    /// Queue rejected an item because its pending bytes would exceed the ceiling.
    pub fn queue_max_pending_bytes() -> Self {
        Self::new(SCHEDULER_NAMESPACE, "queue_max_pending_bytes")
    }

    /// Scheduler no longer accepts work.
    pub fn scheduler_shutdown() -> Self {
        Self::new(SCHEDULER_NAMESPACE, "shutdown")
    }

    /// Pending work was dropped by an explicit queue clear.
    pub fn queue_cleared() -> Self {
        Self::new(SCHEDULER_NAMESPACE, "queue_cleared")
    }

    /// Ordered completion drain exceeded its deadline.
    pub fn ordered_completion_timeout() -> Self {
        Self::new(ORDERED_COMPLETION_NAMESPACE, "TIMEOUT")
    }

    /// Ordered completion drain was cancelled by its caller.
    pub fn ordered_completion_aborted() -> Self {
        Self::new(ORDERED_COMPLETION_NAMESPACE, "ABORTED")
    }

    /// Namespace portion.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Identifier within the namespace.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// `namespace_code`, e.g. `ORDERED_COMPLETION_TIMEOUT`.
    #[must_use]
    pub fn flat(&self) -> String {
        format!("{}_{}", self.namespace, self.code)
    }

    fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => Self::new(CORE_NAMESPACE, "not_found"),
            io::ErrorKind::PermissionDenied => Self::new(CORE_NAMESPACE, "permission_denied"),
            io::ErrorKind::TimedOut => Self::new(CORE_NAMESPACE, "timeout"),
            io::ErrorKind::Interrupted => Self::cancelled(),
            _ => Self::io(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.namespace, self.code)
    }
}

/// The one error type crossing crate boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Origin category.
    pub kind: ErrorKind,
    /// Retry classification.
    pub class: ErrorClass,
    /// Stable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Diagnostic metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: ErrorMetadata,
    /// Envelope this one wraps, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<Self>>,
}

impl ErrorEnvelope {
    fn build(
        kind: ErrorKind,
        class: ErrorClass,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            class,
            code,
            message: message.into(),
            metadata: ErrorMetadata::new(),
            cause: None,
        }
    }

    /// Expected, non-retriable failure.
    pub fn expected(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::build(ErrorKind::Expected, ErrorClass::NonRetriable, code, message)
    }

    /// Expected failure with an explicit retry class.
    pub fn expected_with_class(
        code: ErrorCode,
        message: impl Into<String>,
        class: ErrorClass,
    ) -> Self {
        Self::build(ErrorKind::Expected, class, code, message)
    }

    /// Broken internal contract; never retriable.
    pub fn invariant(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::build(ErrorKind::Invariant, ErrorClass::NonRetriable, code, message)
    }

    /// Unexpected failure.
    pub fn unexpected(code: ErrorCode, message: impl Into<String>, class: ErrorClass) -> Self {
        Self::build(ErrorKind::Unexpected, class, code, message)
    }

    /// Caller cancellation.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::expected(ErrorCode::cancelled(), message)
    }

    /// True for caller cancellation and aborted drains.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::cancelled() || self.code == ErrorCode::ordered_completion_aborted()
    }

    /// Add one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Wrap `cause`.
    #[must_use]
    pub fn with_cause(mut self, cause: Self) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Wrapped envelope, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Self> {
        self.cause.as_deref()
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{} {} {}: {}",
            self.kind, self.class, self.code, self.message
        )
    }
}

impl std::error::Error for ErrorEnvelope {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| -> &(dyn std::error::Error + 'static) { cause })
    }
}

impl From<io::Error> for ErrorEnvelope {
    fn from(error: io::Error) -> Self {
        let kind = error.kind();
        let class = if matches!(
            kind,
            io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted
                | io::ErrorKind::BrokenPipe
        ) {
            ErrorClass::Retriable
        } else {
            ErrorClass::NonRetriable
        };
        Self::unexpected(ErrorCode::from_io_kind(kind), error.to_string(), class)
            .with_metadata("io_kind", kind.to_string())
    }
}
