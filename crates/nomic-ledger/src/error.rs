//! Error types for nomic-ledger.

use thiserror::Error;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur in ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The diff does not apply cleanly to the branch.
    #[error("patch does not apply: {0}")]
    PatchApplyFailed(String),

    /// Merging the branch would conflict with its target.
    #[error("merge conflict merging {branch}: {detail}")]
    MergeConflict { branch: String, detail: String },

    /// Branch or revision does not exist.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// Branch already exists.
    #[error("branch already exists: {0}")]
    BranchExists(String),

    /// File does not exist at the given revision.
    #[error("file {path} not found at {at}")]
    FileNotFound { path: String, at: String },

    /// Branch name or revision rejected before reaching the backend.
    #[error("invalid ref: {0}")]
    InvalidRef(String),

    /// The backing tool failed for a reason not covered above.
    #[error("ledger command failed: {0}")]
    Command(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::patch::PatchError> for LedgerError {
    fn from(e: crate::patch::PatchError) -> Self {
        LedgerError::PatchApplyFailed(e.to_string())
    }
}
