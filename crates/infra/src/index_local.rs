//! Local index builds over a directory tree.

use crate::config_check::load_effective_config;
use crate::observability::observability_from_env;
use crate::scheduler_factory::{index_input_from_config, scheduler_options_from_config};
use crate::{InfraError, InfraResult};
use pairofcleats_adapters::InMemoryIndexStages;
use pairofcleats_app::{IndexBuildDeps, IndexBuildOutput, run_index_build};
use pairofcleats_domain::{ArtifactSet, IndexMode, SourceFile};
use pairofcleats_ports::{LoggerPort, log_fields};
use pairofcleats_scheduler::{BuildScheduler, QueueTelemetry};
use pairofcleats_shared::{CorrelationId, ErrorCode, ErrorEnvelope, RequestContext};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Files larger than this are not indexed.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;

const SKIPPED_DIRS: &[&str] = &["target", "node_modules"];

/// Request for a local index build.
#[derive(Debug, Clone, Default)]
pub struct IndexLocalRequest {
    /// Directory to index.
    pub root: PathBuf,
    /// Optional config file (`.json` or `.toml`).
    pub config_path: Option<PathBuf>,
    /// Optional partial config overrides as JSON.
    pub overrides_json: Option<String>,
    /// Disable stage overlap regardless of config.
    pub no_overlap: bool,
    /// Corpus mode override.
    pub mode: Option<IndexMode>,
    /// Skip files larger than this many bytes (`None` uses the default).
    pub max_file_bytes: Option<u64>,
}

/// Run an index build over `request.root` under a fresh `build_*` correlation id.
pub fn run_index_local(
    request: &IndexLocalRequest,
    env: &BTreeMap<String, String>,
) -> InfraResult<IndexBuildOutput> {
    let ctx = RequestContext::new(CorrelationId::new_build_id());
    run_index_local_with_ctx(&ctx, request, env)
}

/// Run an index build over `request.root` with a caller-provided context.
pub fn run_index_local_with_ctx(
    ctx: &RequestContext,
    request: &IndexLocalRequest,
    env: &BTreeMap<String, String>,
) -> InfraResult<IndexBuildOutput> {
    let mut config = load_effective_config(
        env,
        request.config_path.as_deref(),
        request.overrides_json.as_deref(),
    )?
    .into_inner();
    if request.no_overlap {
        config.pipeline_overlap.enabled = false;
    }
    if let Some(mode) = request.mode {
        config.indexing.mode = mode;
    }
    let config = config.validate_and_normalize().map_err(ErrorEnvelope::from)?;

    let observability = observability_from_env(env);
    let logger = scope_logger(&observability.logger_or_noop(), ctx);
    let telemetry = observability.telemetry_or_noop();
    let max_file_bytes = request.max_file_bytes.unwrap_or(DEFAULT_MAX_FILE_BYTES);

    run_async(async {
        let files = collect_source_files(&request.root, max_file_bytes).await?;
        logger.info(
            "index.files_collected",
            "collected source files",
            Some(log_fields([
                ("files", Value::from(files.len())),
                ("root", Value::from(request.root.display().to_string())),
            ])),
        );

        let scheduler = BuildScheduler::with_telemetry(
            scheduler_options_from_config(&config),
            QueueTelemetry::new(Arc::clone(&telemetry)),
        );
        let deps = IndexBuildDeps::new(scheduler.clone(), Arc::new(InMemoryIndexStages::new()))
            .with_logger(Arc::clone(&logger))
            .with_telemetry(telemetry);
        let input = index_input_from_config(&config, files);
        let output = run_index_build(ctx, &deps, input).await;
        scheduler.shutdown();
        output
    })
}

/// Collect UTF-8 source files under `root`, sorted by relative path.
///
/// Hidden entries, `target`, and `node_modules` are skipped. Relative paths
/// use `/` separators.
pub async fn collect_source_files(root: &Path, max_file_bytes: u64) -> InfraResult<Vec<SourceFile>> {
    let metadata = tokio::fs::metadata(root).await.map_err(|error| {
        ErrorEnvelope::expected(
            ErrorCode::new("index", "invalid_root"),
            format!("cannot read index root: {error}"),
        )
        .with_metadata("root", root.display().to_string())
    })?;
    if !metadata.is_dir() {
        return Err(ErrorEnvelope::expected(
            ErrorCode::new("index", "invalid_root"),
            "index root is not a directory",
        )
        .with_metadata("root", root.display().to_string()));
    }

    let mut files = Vec::new();
    let mut pending = vec![String::new()];
    while let Some(dir) = pending.pop() {
        let mut read_dir = tokio::fs::read_dir(root.join(&dir))
            .await
            .map_err(ErrorEnvelope::from)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(ErrorEnvelope::from)? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let relative = if dir.is_empty() {
                name.clone()
            } else {
                format!("{dir}/{name}")
            };
            let file_type = entry.file_type().await.map_err(ErrorEnvelope::from)?;
            if file_type.is_dir() {
                if !SKIPPED_DIRS.contains(&name.as_str()) {
                    pending.push(relative);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let size = entry.metadata().await.map_err(ErrorEnvelope::from)?.len();
            if size > max_file_bytes {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await.map_err(ErrorEnvelope::from)?;
            if let Ok(content) = String::from_utf8(bytes) {
                files.push(SourceFile::new(relative, content));
            }
        }
    }

    files.sort_by(|left, right| left.relative_path.cmp(&right.relative_path));
    Ok(files)
}

/// Write every artifact under `out_dir`, creating parent directories.
///
/// Returns the number of bytes written.
pub fn write_artifacts_to_dir(out_dir: &Path, artifacts: &ArtifactSet) -> InfraResult<u64> {
    let mut written = 0_u64;
    for (name, bytes) in artifacts.iter() {
        if Path::new(name)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(ErrorEnvelope::invariant(
                ErrorCode::new("index", "invalid_artifact_name"),
                "artifact name must be a relative path",
            )
            .with_metadata("artifact", name.to_owned()));
        }
        let path = out_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ErrorEnvelope::from)?;
        }
        std::fs::write(&path, bytes).map_err(ErrorEnvelope::from)?;
        written = written.saturating_add(u64::try_from(bytes.len()).unwrap_or(u64::MAX));
    }
    Ok(written)
}

fn scope_logger(logger: &Arc<dyn LoggerPort>, ctx: &RequestContext) -> Arc<dyn LoggerPort> {
    Arc::from(logger.child(log_fields([(
        "correlationId",
        Value::from(ctx.correlation_id().as_str()),
    )])))
}

fn run_async<F, T>(future: F) -> InfraResult<T>
where
    F: Future<Output = InfraResult<T>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(InfraError::from)?;
    runtime.block_on(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairofcleats_domain::{BuildStatus, OverlapResolution};
    use std::fs;

    struct TempTree {
        root: PathBuf,
    }

    impl TempTree {
        fn new(label: &str) -> std::io::Result<Self> {
            let root = std::env::temp_dir().join(format!(
                "pairofcleats-infra-{label}-{}",
                RequestContext::new_request().correlation_id().as_str()
            ));
            fs::create_dir_all(&root)?;
            Ok(Self { root })
        }

        fn write(&self, relative: &str, content: &[u8]) -> std::io::Result<()> {
            let path = self.root.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, content)
        }
    }

    impl Drop for TempTree {
        fn drop(&mut self) {
            drop(fs::remove_dir_all(&self.root));
        }
    }

    #[tokio::test]
    async fn collects_sorted_utf8_files_and_skips_hidden_dirs() -> Result<(), Box<dyn std::error::Error>> {
        let tree = TempTree::new("collect")?;
        tree.write("src/b.rs", b"fn b() {}\n")?;
        tree.write("src/a.rs", b"fn a() {}\n")?;
        tree.write("README.md", b"readme\n")?;
        tree.write(".git/config", b"ignored\n")?;
        tree.write("target/out.rs", b"ignored\n")?;
        tree.write("blob.bin", &[0xff, 0xfe, 0x00])?;

        let files = collect_source_files(&tree.root, DEFAULT_MAX_FILE_BYTES).await?;
        let paths: Vec<&str> = files.iter().map(|file| &*file.relative_path).collect();
        assert_eq!(paths, vec!["README.md", "src/a.rs", "src/b.rs"]);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_files_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let tree = TempTree::new("oversized")?;
        tree.write("small.rs", b"fn s() {}\n")?;
        tree.write("large.rs", &[b'x'; 64])?;

        let files = collect_source_files(&tree.root, 32).await?;
        assert_eq!(files.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_root_is_an_expected_error() {
        let result = collect_source_files(Path::new("/definitely/not/here"), 10).await;
        assert!(result.is_err_and(|error| error.code.code() == "invalid_root"));
    }

    #[test]
    fn local_build_writes_artifacts() -> Result<(), Box<dyn std::error::Error>> {
        let tree = TempTree::new("build")?;
        tree.write("src/lib.rs", b"use crate::util;\nfn run() { util(); }\n")?;
        tree.write("src/util.rs", b"pub fn util() {}\n")?;

        let request = IndexLocalRequest {
            root: tree.root.clone(),
            ..IndexLocalRequest::default()
        };
        let output = run_index_local(&request, &BTreeMap::new())?;
        assert!(output.is_completed());
        assert!(!output.digests.is_empty());
        Ok(())
    }

    #[test]
    fn artifacts_are_written_under_out_dir() -> Result<(), Box<dyn std::error::Error>> {
        let tree = TempTree::new("write-out")?;
        let mut artifacts = ArtifactSet::new();
        artifacts.insert("chunk_meta.json", b"[]\n".to_vec());
        artifacts.insert("incremental/bundle_index.json", b"{}\n".to_vec());

        let written = write_artifacts_to_dir(&tree.root, &artifacts)?;
        assert_eq!(written, 6);
        assert_eq!(fs::read(tree.root.join("incremental/bundle_index.json"))?, b"{}\n");
        Ok(())
    }

    #[test]
    fn traversal_artifact_names_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let tree = TempTree::new("write-traversal")?;
        let mut artifacts = ArtifactSet::new();
        artifacts.insert("../escape.json", b"{}".to_vec());

        assert!(write_artifacts_to_dir(&tree.root, &artifacts).is_err());
        Ok(())
    }

    #[test]
    fn no_overlap_flag_disables_overlap() -> Result<(), Box<dyn std::error::Error>> {
        let tree = TempTree::new("no-overlap")?;
        tree.write("main.rs", b"fn main() {}\n")?;

        let request = IndexLocalRequest {
            root: tree.root.clone(),
            no_overlap: true,
            ..IndexLocalRequest::default()
        };
        let output = run_index_local(&request, &BTreeMap::new())?;
        assert!(matches!(output.status, BuildStatus::Completed));
        assert_eq!(output.overlap.postings, OverlapResolution::NotStarted);
        Ok(())
    }
}
