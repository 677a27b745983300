//! Workspace result alias.

use crate::errors::ErrorEnvelope;

/// Result carrying an [`ErrorEnvelope`] unless another error type is named.
pub type Result<T, E = ErrorEnvelope> = std::result::Result<T, E>;
