//! Data flowing between build pipeline stages.
//!
//! Every collection here is ordered (`BTreeMap`, sorted `Vec`) so that the
//! serialized artifacts are byte-identical regardless of completion order.

use crate::primitives::ChunkId;
use crate::spans::LineSpan;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A source file handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    /// Path relative to the build root, `/`-separated.
    pub relative_path: Box<str>,
    /// UTF-8 content.
    pub content: Box<str>,
}

impl SourceFile {
    /// Build a source file.
    pub fn new(relative_path: impl Into<Box<str>>, content: impl Into<Box<str>>) -> Self {
        Self {
            relative_path: relative_path.into(),
            content: content.into(),
        }
    }

    /// Content size in bytes.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        u64::try_from(self.content.len()).unwrap_or(u64::MAX)
    }
}

/// A chunk of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    /// Stable chunk id.
    pub id: ChunkId,
    /// Owning file.
    pub relative_path: Box<str>,
    /// Lines covered.
    pub span: LineSpan,
    /// Chunk text.
    pub text: Box<str>,
    /// Lower-cased tokens in first-seen order, deduplicated.
    pub tokens: Vec<Box<str>>,
}

/// Output of processing one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedFile {
    /// Position of the file in the sorted input list.
    pub index: usize,
    /// Path relative to the build root.
    pub relative_path: Box<str>,
    /// Chunks in file order.
    pub chunks: Vec<FileChunk>,
    /// Import targets in file order.
    pub imports: Vec<Box<str>>,
}

/// Inverted index from token to the ordinal of each chunk containing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingsIndex {
    /// Token to ascending chunk ordinals.
    pub terms: BTreeMap<Box<str>, Vec<u32>>,
}

/// Cross-file import graph keyed by importing file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationGraph {
    /// File to sorted, deduplicated resolved imports.
    pub edges: BTreeMap<Box<str>, Vec<Box<str>>>,
}

/// Result of the relations stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationsOutcome {
    /// Whether cross-file inference actually ran.
    pub cross_file_enabled: bool,
    /// Import graph (empty when nothing ran).
    pub graph: RelationGraph,
}

/// A row describing one chunk in the virtual file system used by incremental builds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VfsRow {
    /// Owning file.
    pub relative_path: Box<str>,
    /// Chunk id.
    pub chunk_id: ChunkId,
    /// SHA-256 of the chunk text, hex.
    pub content_hash: Box<str>,
}

/// Serialized index files keyed by artifact name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    files: BTreeMap<Box<str>, Vec<u8>>,
}

impl ArtifactSet {
    /// Create an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    /// Insert or replace an artifact.
    pub fn insert(&mut self, name: impl Into<Box<str>>, bytes: Vec<u8>) {
        self.files.insert(name.into(), bytes);
    }

    /// Borrow an artifact's bytes.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    /// Iterate artifacts in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files
            .iter()
            .map(|(name, bytes)| (name.as_ref(), bytes.as_slice()))
    }

    /// Number of artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true when no artifacts were produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total size of all artifacts in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files
            .values()
            .map(|bytes| u64::try_from(bytes.len()).unwrap_or(u64::MAX))
            .fold(0, u64::saturating_add)
    }

    /// Per-artifact SHA-256 digests, hex.
    #[must_use]
    pub fn digests(&self) -> BTreeMap<Box<str>, String> {
        self.files
            .iter()
            .map(|(name, bytes)| (name.clone(), sha256_hex(bytes)))
            .collect()
    }

    /// Digest over every artifact name and body, in name order.
    #[must_use]
    pub fn combined_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, bytes) in &self.files {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(bytes);
            hasher.update([0u8]);
        }
        hex(&hasher.finalize())
    }
}

/// SHA-256 of `bytes`, lower-case hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}
