//! # pairofcleats-domain
//!
//! Domain primitives and stage data for the pairofcleats build pipeline.
//!
//! - **Primitives** - `QueueName`, `ChannelName`, `ChunkId`, `IndexMode`, `ResourceClass`
//! - **Spans** - `LineSpan`
//! - **Index** - source files, chunks, postings, relations, VFS rows, artifacts
//! - **States** - overlap resolution and build status
//!
//! ## Dependency Rules
//!
//! - Depends only on `shared` crate
//! - No I/O

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub use pairofcleats_shared::shared_crate_version;

pub mod index;
pub mod primitives;
pub mod spans;
pub mod states;

pub use index::{
    ArtifactSet, FileChunk, PostingsIndex, ProcessedFile, RelationGraph, RelationsOutcome,
    SourceFile, VfsRow, sha256_hex,
};
pub use primitives::{
    ChannelName, ChunkId, IndexMode, PrimitiveError, QueueName, ResourceClass, channels,
    derive_chunk_id, queues,
};
pub use spans::LineSpan;
pub use states::{BuildStatus, OverlapResolution};

/// Returns the domain crate version.
#[must_use]
pub const fn domain_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_crate_compiles() {
        assert!(!domain_crate_version().is_empty());
        assert!(!shared_crate_version().is_empty());
    }
}
