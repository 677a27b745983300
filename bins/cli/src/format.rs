//! Output format helpers for CLI commands.

use clap::{Args, ValueEnum};
use pairofcleats_shared::{ErrorEnvelope, ErrorKind};
use serde::Serialize;
use std::collections::BTreeMap;

/// Output format choices for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-friendly text output.
    Text,
    /// Machine-friendly JSON output.
    Json,
    /// Line-delimited JSON (NDJSON) output.
    Ndjson,
}

/// Output-related CLI flags.
#[derive(Debug, Args)]
pub struct OutputArgs {
    /// Output format for command responses.
    #[arg(long, global = true, value_enum)]
    pub output: Option<OutputFormat>,
    /// Emit machine-friendly defaults (NDJSON output, no progress).
    #[arg(long, global = true)]
    pub agent: bool,
    /// Suppress progress/logging output.
    #[arg(long, global = true)]
    pub no_progress: bool,
}

/// Output mode derived from CLI flags.
#[derive(Debug, Clone, Copy)]
pub struct OutputMode {
    pub format: OutputFormat,
    pub no_progress: bool,
}

impl OutputMode {
    /// Build output mode from CLI flags.
    #[must_use]
    pub const fn from_args(args: &OutputArgs) -> Self {
        let format = match (args.output, args.agent) {
            (Some(value), _) => value,
            (None, true) => OutputFormat::Ndjson,
            (None, false) => OutputFormat::Text,
        };

        Self {
            format,
            no_progress: args.agent || args.no_progress,
        }
    }

    /// Mode with progress lines suppressed.
    #[cfg(test)]
    #[must_use]
    pub const fn quiet(format: OutputFormat) -> Self {
        Self {
            format,
            no_progress: true,
        }
    }

    /// Returns true when JSON output is requested.
    #[must_use]
    pub const fn is_json(self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Returns true when NDJSON output is requested.
    #[must_use]
    pub const fn is_ndjson(self) -> bool {
        matches!(self.format, OutputFormat::Ndjson)
    }
}

/// Error payload shown at the CLI boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    /// `namespace:code`.
    pub code: String,
    pub message: String,
    /// `EXPECTED`, `INVARIANT`, or `UNEXPECTED`.
    pub kind: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl From<&ErrorEnvelope> for ErrorReport {
    fn from(error: &ErrorEnvelope) -> Self {
        Self {
            code: error.code.to_string(),
            message: error.message.clone(),
            kind: match error.kind {
                ErrorKind::Expected => "EXPECTED",
                ErrorKind::Invariant => "INVARIANT",
                ErrorKind::Unexpected => "UNEXPECTED",
            },
            meta: error.metadata.clone(),
        }
    }
}

impl ErrorReport {
    /// Multi-line `key: value` rendering.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str("code: ");
        out.push_str(&self.code);
        out.push('\n');
        out.push_str("message: ");
        out.push_str(&self.message);
        out.push('\n');
        out.push_str("kind: ");
        out.push_str(self.kind);
        out.push('\n');

        if !self.meta.is_empty() {
            out.push_str("meta:\n");
            for (key, value) in &self.meta {
                out.push_str("  ");
                out.push_str(key);
                out.push_str(": ");
                out.push_str(value);
                out.push('\n');
            }
        }

        out
    }
}

/// One-line NDJSON summary record.
pub fn ndjson_summary(status: &str, kind: &str, extra: Option<serde_json::Value>) -> String {
    let mut payload = serde_json::Map::new();
    payload.insert("type".to_string(), "summary".into());
    payload.insert("status".to_string(), status.into());
    payload.insert("kind".to_string(), kind.into());
    if let Some(serde_json::Value::Object(map)) = extra {
        payload.extend(map);
    }
    let mut out = serde_json::to_string(&serde_json::Value::Object(payload)).unwrap_or_else(|_| {
        "{\"type\":\"summary\",\"status\":\"error\",\"kind\":\"internal\"}".to_string()
    });
    out.push('\n');
    out
}

/// Pretty JSON with a trailing newline.
pub fn pretty_json(value: &impl Serialize) -> Result<String, serde_json::Error> {
    let mut out = serde_json::to_string_pretty(value)?;
    out.push('\n');
    Ok(out)
}
