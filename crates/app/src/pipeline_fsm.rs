//! State machine for the index build pipeline.

/// Index build pipeline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexBuildState {
    /// Inputs validated, nothing started.
    Prepared,
    /// Every file processed and flushed in index order.
    FilesProcessed,
    /// Relations stage finished or skipped.
    Relations,
    /// Postings joined or built.
    Postings,
    /// Artifacts written.
    Written,
    /// Build finished.
    Completed,
}

impl IndexBuildState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::FilesProcessed => "filesProcessed",
            Self::Relations => "relations",
            Self::Postings => "postings",
            Self::Written => "written",
            Self::Completed => "completed",
        }
    }
}

/// All states in pipeline order.
pub const INDEX_BUILD_STATES: [IndexBuildState; 6] = [
    IndexBuildState::Prepared,
    IndexBuildState::FilesProcessed,
    IndexBuildState::Relations,
    IndexBuildState::Postings,
    IndexBuildState::Written,
    IndexBuildState::Completed,
];

/// Allowed `(from, to)` transitions.
pub const INDEX_BUILD_TRANSITIONS: [(IndexBuildState, IndexBuildState); 5] = [
    (IndexBuildState::Prepared, IndexBuildState::FilesProcessed),
    (IndexBuildState::FilesProcessed, IndexBuildState::Relations),
    (IndexBuildState::Relations, IndexBuildState::Postings),
    (IndexBuildState::Postings, IndexBuildState::Written),
    (IndexBuildState::Written, IndexBuildState::Completed),
];
