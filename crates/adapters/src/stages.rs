//! Deterministic in-memory implementation of the build stages.
//!
//! - chunks are runs of non-blank lines
//! - relations come from `import` / `use` lines
//! - postings map each token to the ordinals of the chunks containing it
//! - artifacts are JSON with sorted keys, written into an in-memory set
//!
//! A [`FaultPlan`] injects failures and delays for tests.

use pairofcleats_domain::{
    ArtifactSet, FileChunk, LineSpan, PostingsIndex, ProcessedFile, RelationGraph,
    RelationsOutcome, SourceFile, VfsRow, derive_chunk_id, sha256_hex,
};
use pairofcleats_ports::{
    ArtifactInputs, BoxFuture, IndexStagesPort, PendingArtifact, RelationsRequest,
};
use pairofcleats_shared::{ErrorCode, ErrorEnvelope, RequestContext, Result};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Artifact holding chunk metadata.
pub const CHUNK_META_ARTIFACT: &str = "chunk_meta.json";
/// Artifact holding per-file metadata.
pub const FILE_META_ARTIFACT: &str = "file_meta.json";
/// Artifact holding the postings index.
pub const POSTINGS_ARTIFACT: &str = "token_postings.json";
/// Artifact holding the relations outcome.
pub const RELATIONS_ARTIFACT: &str = "relations.json";
/// Artifact summarizing the build.
pub const INDEX_STATE_ARTIFACT: &str = "index_state.json";
/// Incremental VFS manifest, one JSON row per line.
pub const VFS_MANIFEST_ARTIFACT: &str = "incremental/vfs_manifest.jsonl";
/// Incremental bundle index.
pub const BUNDLE_INDEX_ARTIFACT: &str = "incremental/bundle_index.json";

const IMPORT_PREFIXES: [&str; 2] = ["import ", "use "];

/// Failures and delays to inject.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Files whose processing fails.
    pub fail_files: BTreeSet<String>,
    /// Artifacts whose write fails.
    pub fail_artifacts: BTreeSet<String>,
    /// Fail postings construction.
    pub fail_postings: bool,
    /// Fail the relations stage.
    pub fail_relations: bool,
    /// Fail VFS row preparation.
    pub fail_vfs_rows: bool,
    /// Per-file processing delay.
    pub file_delays: BTreeMap<String, Duration>,
    /// Delay applied to every artifact write.
    pub write_delay: Option<Duration>,
}

impl FaultPlan {
    /// Fail processing of `path`.
    #[must_use]
    pub fn failing_file(mut self, path: &str) -> Self {
        self.fail_files.insert(path.to_owned());
        self
    }

    /// Fail writing `artifact`.
    #[must_use]
    pub fn failing_artifact(mut self, artifact: &str) -> Self {
        self.fail_artifacts.insert(artifact.to_owned());
        self
    }

    /// Delay processing of `path`.
    #[must_use]
    pub fn delaying_file(mut self, path: &str, delay: Duration) -> Self {
        self.file_delays.insert(path.to_owned(), delay);
        self
    }
}

fn injected(stage: &str, target: &str) -> ErrorEnvelope {
    tracing::debug!(stage, target, "injecting fault");
    ErrorEnvelope::expected(
        ErrorCode::new("stages", "injected_fault"),
        format!("injected {stage} failure for {target}"),
    )
    .with_metadata("stage", stage)
    .with_metadata("target", target)
}

#[derive(Debug, Default)]
struct StagesInner {
    faults: FaultPlan,
    written: Mutex<ArtifactSet>,
    postings_builds: Mutex<usize>,
    vfs_builds: Mutex<usize>,
}

/// Clonable in-memory stages.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIndexStages {
    inner: Arc<StagesInner>,
}

impl InMemoryIndexStages {
    /// Stages without injected faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages applying `faults`.
    #[must_use]
    pub fn with_faults(faults: FaultPlan) -> Self {
        Self {
            inner: Arc::new(StagesInner {
                faults,
                ..StagesInner::default()
            }),
        }
    }

    /// Artifacts written so far.
    #[must_use]
    pub fn written(&self) -> ArtifactSet {
        lock(&self.inner.written).clone()
    }

    /// How many times postings were built.
    #[must_use]
    pub fn postings_builds(&self) -> usize {
        *lock(&self.inner.postings_builds)
    }

    /// How many times VFS rows were computed.
    #[must_use]
    pub fn vfs_builds(&self) -> usize {
        *lock(&self.inner.vfs_builds)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl IndexStagesPort for InMemoryIndexStages {
    fn process_file(
        &self,
        ctx: &RequestContext,
        index: usize,
        file: SourceFile,
    ) -> BoxFuture<'static, Result<ProcessedFile>> {
        let ctx = ctx.clone();
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            ctx.ensure_not_cancelled("process_file")?;
            let path = &*file.relative_path;
            if let Some(delay) = inner.faults.file_delays.get(path) {
                tokio::time::sleep(*delay).await;
            }
            if inner.faults.fail_files.contains(path) {
                return Err(injected("process_file", path));
            }
            process_source(index, &file)
        })
    }

    fn build_postings(
        &self,
        ctx: &RequestContext,
        files: Arc<[ProcessedFile]>,
    ) -> BoxFuture<'static, Result<PostingsIndex>> {
        let ctx = ctx.clone();
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            ctx.ensure_not_cancelled("build_postings")?;
            *lock(&inner.postings_builds) += 1;
            if inner.faults.fail_postings {
                return Err(injected("build_postings", "postings"));
            }
            Ok(build_postings_index(&files))
        })
    }

    fn run_relations(
        &self,
        ctx: &RequestContext,
        files: Arc<[ProcessedFile]>,
        request: RelationsRequest,
    ) -> BoxFuture<'static, Result<RelationsOutcome>> {
        let ctx = ctx.clone();
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            ctx.ensure_not_cancelled("run_relations")?;
            if inner.faults.fail_relations {
                return Err(injected("run_relations", "relations"));
            }
            if !request.any() {
                return Ok(RelationsOutcome::default());
            }
            let graph = if request.import_graph {
                build_import_graph(&files)
            } else {
                RelationGraph::default()
            };
            Ok(RelationsOutcome {
                cross_file_enabled: request.cross_file_inference,
                graph,
            })
        })
    }

    fn prepare_vfs_rows(
        &self,
        ctx: &RequestContext,
        files: Arc<[ProcessedFile]>,
    ) -> BoxFuture<'static, Result<Vec<VfsRow>>> {
        let ctx = ctx.clone();
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            ctx.ensure_not_cancelled("prepare_vfs_rows")?;
            *lock(&inner.vfs_builds) += 1;
            if inner.faults.fail_vfs_rows {
                return Err(injected("prepare_vfs_rows", "vfs"));
            }
            Ok(vfs_rows(&files))
        })
    }

    fn serialize_artifacts(&self, inputs: &ArtifactInputs) -> Result<Vec<PendingArtifact>> {
        let chunks: Vec<Value> = inputs
            .files
            .iter()
            .flat_map(|file| file.chunks.iter())
            .enumerate()
            .map(|(ordinal, chunk)| {
                json!({
                    "ordinal": ordinal,
                    "id": chunk.id.as_str(),
                    "file": &*chunk.relative_path,
                    "startLine": chunk.span.start_line(),
                    "endLine": chunk.span.end_line(),
                    "tokenCount": chunk.tokens.len(),
                })
            })
            .collect();
        let files: Vec<Value> = inputs
            .files
            .iter()
            .map(|file| {
                json!({
                    "index": file.index,
                    "file": &*file.relative_path,
                    "chunkCount": file.chunks.len(),
                    "imports": file.imports,
                })
            })
            .collect();
        let state = json!({
            "mode": inputs.mode.as_str(),
            "fileCount": inputs.files.len(),
            "chunkCount": chunks.len(),
            "termCount": inputs.postings.terms.len(),
            "crossFileEnabled": inputs.relations.cross_file_enabled,
        });

        Ok(vec![
            json_artifact(CHUNK_META_ARTIFACT, &Value::Array(chunks))?,
            json_artifact(FILE_META_ARTIFACT, &Value::Array(files))?,
            json_artifact(POSTINGS_ARTIFACT, &to_value(&inputs.postings)?)?,
            json_artifact(RELATIONS_ARTIFACT, &to_value(&inputs.relations)?)?,
            json_artifact(INDEX_STATE_ARTIFACT, &state)?,
        ])
    }

    fn write_artifact(
        &self,
        ctx: &RequestContext,
        artifact: PendingArtifact,
    ) -> BoxFuture<'static, Result<()>> {
        let ctx = ctx.clone();
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            ctx.ensure_not_cancelled("write_artifact")?;
            if let Some(delay) = inner.faults.write_delay {
                tokio::time::sleep(delay).await;
            }
            if inner.faults.fail_artifacts.contains(&*artifact.name) {
                return Err(injected("write_artifact", &artifact.name));
            }
            lock(&inner.written).insert(artifact.name, artifact.bytes.to_vec());
            Ok(())
        })
    }

    fn update_incremental_bundles(
        &self,
        ctx: &RequestContext,
        files: Arc<[ProcessedFile]>,
        prefetched: Option<Vec<VfsRow>>,
    ) -> BoxFuture<'static, Result<Vec<PendingArtifact>>> {
        let ctx = ctx.clone();
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            ctx.ensure_not_cancelled("update_incremental_bundles")?;
            let rows = match prefetched {
                Some(rows) => rows,
                None => {
                    *lock(&inner.vfs_builds) += 1;
                    vfs_rows(&files)
                },
            };
            let mut manifest = String::new();
            for row in &rows {
                manifest.push_str(&serde_json::to_string(row).map_err(serialize_error)?);
                manifest.push('\n');
            }
            let bundles: BTreeMap<&str, Vec<&str>> =
                rows.iter().fold(BTreeMap::new(), |mut acc, row| {
                    acc.entry(&*row.relative_path)
                        .or_insert_with(Vec::new)
                        .push(row.chunk_id.as_str());
                    acc
                });
            Ok(vec![
                PendingArtifact::new(VFS_MANIFEST_ARTIFACT, manifest.into_bytes()),
                json_artifact(BUNDLE_INDEX_ARTIFACT, &json!({ "files": bundles }))?,
            ])
        })
    }
}

fn serialize_error(error: serde_json::Error) -> ErrorEnvelope {
    ErrorEnvelope::invariant(
        ErrorCode::new("stages", "serialize_failed"),
        format!("artifact serialization failed: {error}"),
    )
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(serialize_error)
}

fn json_artifact(name: &str, value: &Value) -> Result<PendingArtifact> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(serialize_error)?;
    bytes.push(b'\n');
    Ok(PendingArtifact::new(name, bytes))
}

/// Split `file` into chunks and collect its imports.
pub fn process_source(index: usize, file: &SourceFile) -> Result<ProcessedFile> {
    let path = &*file.relative_path;
    let mut chunks = Vec::new();
    let mut imports = Vec::new();
    let mut current: Vec<(u32, &str)> = Vec::new();

    for (line_index, line) in file.content.lines().enumerate() {
        let line_no = u32::try_from(line_index + 1).unwrap_or(u32::MAX);
        if let Some(target) = import_target(line) {
            imports.push(Box::from(target));
        }
        if line.trim().is_empty() {
            if !current.is_empty() {
                chunks.push(make_chunk(path, &current)?);
                current.clear();
            }
        } else {
            current.push((line_no, line));
        }
    }
    if !current.is_empty() {
        chunks.push(make_chunk(path, &current)?);
    }

    Ok(ProcessedFile {
        index,
        relative_path: file.relative_path.clone(),
        chunks,
        imports,
    })
}

fn make_chunk(path: &str, lines: &[(u32, &str)]) -> Result<FileChunk> {
    let start = lines.first().map_or(1, |(line, _)| *line);
    let end = lines.last().map_or(start, |(line, _)| *line);
    let span = LineSpan::new(start, end)?;
    let text = lines
        .iter()
        .map(|(_, line)| *line)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(FileChunk {
        id: derive_chunk_id(path, span)?,
        relative_path: Box::from(path),
        span,
        tokens: tokenize(&text),
        text: text.into_boxed_str(),
    })
}

/// Lower-cased identifier tokens in first-seen order, deduplicated.
pub fn tokenize(text: &str) -> Vec<Box<str>> {
    let mut seen = BTreeSet::new();
    text.split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .filter(|token| seen.insert(token.clone()))
        .map(String::into_boxed_str)
        .collect()
}

fn import_target(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let rest = IMPORT_PREFIXES
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))?;
    let target = rest
        .split_whitespace()
        .next()?
        .trim_end_matches(';')
        .trim_matches(|ch| ch == '"' || ch == '\'');
    (!target.is_empty()).then_some(target)
}

fn build_postings_index(files: &[ProcessedFile]) -> PostingsIndex {
    let mut terms: BTreeMap<Box<str>, Vec<u32>> = BTreeMap::new();
    let chunks = files.iter().flat_map(|file| file.chunks.iter());
    for (ordinal, chunk) in chunks.enumerate() {
        let ordinal = u32::try_from(ordinal).unwrap_or(u32::MAX);
        for token in &chunk.tokens {
            terms.entry(token.clone()).or_default().push(ordinal);
        }
    }
    for ordinals in terms.values_mut() {
        ordinals.sort_unstable();
        ordinals.dedup();
    }
    PostingsIndex { terms }
}

fn module_key(path: &str) -> String {
    let stem = path.rsplit_once('.').map_or(path, |(stem, _)| stem);
    stem.replace('\\', "/")
}

fn resolve_import<'a>(target: &str, modules: &'a BTreeMap<String, &'a str>) -> Option<&'a str> {
    let normalized = target.replace("::", "/").replace('.', "/");
    let normalized = normalized.trim_start_matches("./");
    modules
        .iter()
        .find(|(key, _)| {
            key.as_str() == normalized || key.ends_with(&format!("/{normalized}"))
        })
        .map(|(_, path)| *path)
}

fn build_import_graph(files: &[ProcessedFile]) -> RelationGraph {
    let modules: BTreeMap<String, &str> = files
        .iter()
        .map(|file| (module_key(&file.relative_path), &*file.relative_path))
        .collect();
    let edges = files
        .iter()
        .map(|file| {
            let mut resolved: Vec<Box<str>> = file
                .imports
                .iter()
                .filter_map(|target| resolve_import(target, &modules))
                .filter(|path| *path != &*file.relative_path)
                .map(Box::from)
                .collect();
            resolved.sort();
            resolved.dedup();
            (file.relative_path.clone(), resolved)
        })
        .filter(|(_, resolved)| !resolved.is_empty())
        .collect();
    RelationGraph { edges }
}

fn vfs_rows(files: &[ProcessedFile]) -> Vec<VfsRow> {
    let mut rows: Vec<VfsRow> = files
        .iter()
        .flat_map(|file| file.chunks.iter())
        .map(|chunk| VfsRow {
            relative_path: chunk.relative_path.clone(),
            chunk_id: chunk.id.clone(),
            content_hash: sha256_hex(chunk.text.as_bytes()).into_boxed_str(),
        })
        .collect();
    rows.sort();
    rows
}
