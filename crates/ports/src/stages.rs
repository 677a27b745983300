//! Build pipeline stage contract.
//!
//! The scheduler decides when each stage runs; implementations of
//! [`IndexStagesPort`] decide what it computes. Every method returning a
//! future returns a `'static` one so callers can run it on a spawned task.

use crate::BoxFuture;
use pairofcleats_domain::{
    IndexMode, PostingsIndex, ProcessedFile, RelationsOutcome, SourceFile, VfsRow,
};
use pairofcleats_shared::{RequestContext, Result};
use std::sync::Arc;

/// Which cross-file passes the relations stage should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelationsRequest {
    /// Cross-file type and usage inference.
    pub cross_file_inference: bool,
    /// Import graph construction.
    pub import_graph: bool,
}

impl RelationsRequest {
    /// Returns true when at least one pass is requested.
    #[must_use]
    pub const fn any(self) -> bool {
        self.cross_file_inference || self.import_graph
    }
}

/// Serialized artifact waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingArtifact {
    /// Artifact name, e.g. `chunk_meta.json`.
    pub name: Box<str>,
    /// Serialized bytes.
    pub bytes: Arc<[u8]>,
}

impl PendingArtifact {
    /// Build a pending artifact.
    pub fn new(name: impl Into<Box<str>>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// Size in bytes.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }
}

/// Everything the artifact serializer needs.
#[derive(Debug, Clone)]
pub struct ArtifactInputs {
    /// Corpus being built.
    pub mode: IndexMode,
    /// Processed files in index order.
    pub files: Arc<[ProcessedFile]>,
    /// Postings index.
    pub postings: PostingsIndex,
    /// Relations stage outcome.
    pub relations: RelationsOutcome,
}

/// Boundary contract for the work each pipeline stage performs.
pub trait IndexStagesPort: Send + Sync {
    /// Parse, chunk, and tokenize one file.
    fn process_file(
        &self,
        ctx: &RequestContext,
        index: usize,
        file: SourceFile,
    ) -> BoxFuture<'static, Result<ProcessedFile>>;

    /// Build the postings index from processed files.
    fn build_postings(
        &self,
        ctx: &RequestContext,
        files: Arc<[ProcessedFile]>,
    ) -> BoxFuture<'static, Result<PostingsIndex>>;

    /// Run cross-file inference and the import graph.
    fn run_relations(
        &self,
        ctx: &RequestContext,
        files: Arc<[ProcessedFile]>,
        request: RelationsRequest,
    ) -> BoxFuture<'static, Result<RelationsOutcome>>;

    /// Compute VFS rows for incremental bundles.
    fn prepare_vfs_rows(
        &self,
        ctx: &RequestContext,
        files: Arc<[ProcessedFile]>,
    ) -> BoxFuture<'static, Result<Vec<VfsRow>>>;

    /// Serialize index artifacts in a deterministic order.
    fn serialize_artifacts(&self, inputs: &ArtifactInputs) -> Result<Vec<PendingArtifact>>;

    /// Persist one artifact.
    fn write_artifact(
        &self,
        ctx: &RequestContext,
        artifact: PendingArtifact,
    ) -> BoxFuture<'static, Result<()>>;

    /// Produce incremental bundle artifacts, reusing `prefetched` rows when given.
    fn update_incremental_bundles(
        &self,
        ctx: &RequestContext,
        files: Arc<[ProcessedFile]>,
        prefetched: Option<Vec<VfsRow>>,
    ) -> BoxFuture<'static, Result<Vec<PendingArtifact>>>;
}
