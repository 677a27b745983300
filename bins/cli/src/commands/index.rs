//! Index command handler.

use crate::error::{CliError, ExitCode};
use crate::format::{OutputMode, ndjson_summary, pretty_json};
use crate::{CliOutput, format_error_output, log_info};
use pairofcleats_app::IndexBuildOutput;
use pairofcleats_domain::{BuildStatus, IndexMode};
use pairofcleats_infra::{IndexLocalRequest, run_index_local, write_artifacts_to_dir};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Parsed `index` arguments.
#[derive(Debug, Clone, Default)]
pub struct IndexCommandInput {
    pub root: PathBuf,
    pub config: Option<PathBuf>,
    pub overrides_json: Option<String>,
    pub no_overlap: bool,
    pub mode: Option<IndexMode>,
    pub out_dir: Option<PathBuf>,
}

/// Run the index command.
pub fn run_index(
    mode: OutputMode,
    input: &IndexCommandInput,
    env: &BTreeMap<String, String>,
) -> Result<CliOutput, CliError> {
    let request = IndexLocalRequest {
        root: input.root.clone(),
        config_path: input.config.clone(),
        overrides_json: input.overrides_json.clone(),
        no_overlap: input.no_overlap,
        mode: input.mode,
        max_file_bytes: None,
    };

    let output = match run_index_local(&request, env) {
        Ok(output) => output,
        Err(error) => return Ok(format_error_output(mode, &error, ExitCode::for_envelope(&error))),
    };

    let mut stderr = String::new();
    if let Some(out_dir) = input.out_dir.as_deref() {
        match write_artifacts_to_dir(out_dir, &output.artifacts) {
            Ok(bytes) => log_info(
                &mut stderr,
                &format!("wrote {bytes} bytes to {}", out_dir.display()),
                mode.no_progress,
            ),
            Err(error) => {
                return Ok(format_error_output(mode, &error, ExitCode::for_envelope(&error)));
            },
        }
    }
    log_info(&mut stderr, "index build finished", mode.no_progress);

    let stdout = if mode.is_ndjson() {
        ndjson_summary(
            status_label(&output),
            "index",
            Some(serde_json::json!({
                "artifacts": output.digests.len(),
                "combinedDigest": output.combined_digest,
                "failure": failure_json(&output.status),
            })),
        )
    } else if mode.is_json() {
        pretty_json(&serde_json::json!({
            "status": status_label(&output),
            "build": output,
        }))?
    } else {
        format_index_text(&output)
    };

    Ok(CliOutput {
        stdout,
        stderr,
        exit_code: if output.is_completed() {
            ExitCode::Ok
        } else {
            ExitCode::BuildFailed
        },
    })
}

const fn status_label(output: &IndexBuildOutput) -> &'static str {
    match output.status {
        BuildStatus::Completed => "ok",
        BuildStatus::Failed { .. } => "failed",
    }
}

fn failure_json(status: &BuildStatus) -> serde_json::Value {
    match status {
        BuildStatus::Completed => serde_json::Value::Null,
        BuildStatus::Failed { error, pending } => serde_json::json!({
            "code": error.code.to_string(),
            "message": error.message,
            "pending": pending,
        }),
    }
}

fn format_index_text(output: &IndexBuildOutput) -> String {
    let stats = &output.stage_stats;
    let mut out = String::new();
    // Writes to a String cannot fail.
    let _ = writeln!(out, "status: {}", status_label(output));
    let _ = writeln!(out, "build: {}", output.status.summary());
    let _ = writeln!(out, "stageStats:");
    let _ = writeln!(
        out,
        "  files: files={} failed={} chunks={} durationMs={}",
        stats.files.files, stats.files.failed, stats.files.chunks, stats.files.duration_ms
    );
    let _ = writeln!(
        out,
        "  relations: ran={} crossFile={} edges={} durationMs={}",
        stats.relations.ran,
        stats.relations.cross_file_enabled,
        stats.relations.edges,
        stats.relations.duration_ms
    );
    let _ = writeln!(
        out,
        "  postings: terms={} joinMs={}",
        stats.postings.terms, stats.postings.join_ms
    );
    let _ = writeln!(
        out,
        "  write: artifacts={} bytes={} longestStallSecs={} durationMs={}",
        stats.write.artifacts,
        stats.write.bytes,
        stats.write.longest_stall_secs,
        stats.write.duration_ms
    );
    let _ = writeln!(
        out,
        "overlap: postings={} vfsPrefetch={}",
        output.overlap.postings.as_str(),
        output.overlap.vfs_prefetch.as_str()
    );
    let _ = writeln!(out, "queues:");
    for (name, queue) in &output.scheduler.queues {
        let _ = writeln!(
            out,
            "  {name}: scheduled={} completed={} failed={} rejected={}",
            queue.scheduled, queue.completed, queue.failed, queue.rejected
        );
    }
    let _ = writeln!(out, "artifacts:");
    for (name, digest) in &output.digests {
        let _ = writeln!(out, "  {name} {digest}");
    }
    let _ = writeln!(out, "combinedDigest: {}", output.combined_digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::OutputFormat;

    fn seed_repo(label: &str) -> std::io::Result<PathBuf> {
        let root = std::env::temp_dir().join(format!(
            "pairofcleats-cli-{label}-{}",
            pairofcleats_shared::CorrelationId::new_request_id().as_str()
        ));
        std::fs::create_dir_all(root.join("src"))?;
        std::fs::write(root.join("src/lib.rs"), "use crate::util;\nfn run() {}\n")?;
        std::fs::write(root.join("src/util.rs"), "pub fn util() {}\n")?;
        Ok(root)
    }

    #[test]
    fn text_output_lists_artifacts_and_queues() -> Result<(), Box<dyn std::error::Error>> {
        let root = seed_repo("text")?;
        let input = IndexCommandInput {
            root: root.clone(),
            ..IndexCommandInput::default()
        };
        let output = run_index(OutputMode::quiet(OutputFormat::Text), &input, &BTreeMap::new())?;

        assert_eq!(output.exit_code, ExitCode::Ok);
        assert!(output.stdout.starts_with("status: ok\nbuild: completed\n"));
        assert!(output.stdout.contains("  chunk_meta.json "));
        assert!(output.stdout.contains("  stage1.cpu: scheduled=2 completed=2 failed=0"));
        assert!(output.stderr.is_empty());
        drop(std::fs::remove_dir_all(root));
        Ok(())
    }

    #[test]
    fn missing_root_is_invalid_input() -> Result<(), CliError> {
        let input = IndexCommandInput {
            root: PathBuf::from("/definitely/not/a/repo"),
            ..IndexCommandInput::default()
        };
        let output = run_index(OutputMode::quiet(OutputFormat::Json), &input, &BTreeMap::new())?;

        assert_eq!(output.exit_code, ExitCode::InvalidInput);
        assert!(output.stdout.contains("\"index:invalid_root\""));
        Ok(())
    }

    #[test]
    fn out_dir_receives_artifacts() -> Result<(), Box<dyn std::error::Error>> {
        let root = seed_repo("out-dir")?;
        let out_dir = root.join("out");
        let input = IndexCommandInput {
            root: root.join("src"),
            out_dir: Some(out_dir.clone()),
            ..IndexCommandInput::default()
        };
        let output = run_index(OutputMode::quiet(OutputFormat::Ndjson), &input, &BTreeMap::new())?;

        assert_eq!(output.exit_code, ExitCode::Ok);
        assert!(out_dir.join("token_postings.json").is_file());
        let summary: serde_json::Value = serde_json::from_str(output.stdout.trim())?;
        assert_eq!(summary.get("status"), Some(&serde_json::Value::from("ok")));
        drop(std::fs::remove_dir_all(root));
        Ok(())
    }
}
