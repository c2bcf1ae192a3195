//! Nomic Ledger - Version-Controlled Rule History
//!
//! The ledger is the single source of ratified rule truth. It holds file
//! contents only; game state lives elsewhere.
//!
//! # Model
//!
//! ```text
//! trunk ──●────────●──────────●───►   ratified history
//!          \      /  \       /
//! prop-301  ●────●    │     /         branch per proposal
//!                     └──●─┘ prop-302
//! ```
//!
//! - **Trunk**: always-ratified branch, read by everyone
//! - **Branches**: transient working areas, one per proposal
//! - **Merge**: atomic; a conflict leaves trunk untouched
//!
//! # Backends
//!
//! - [`GitLedger`]: drives the `git` CLI on a local repository
//! - [`MemoryLedger`]: in-process, content-addressed, for tests and ephemeral games

pub mod error;
pub mod git;
pub mod memory;
pub mod patch;

pub use error::{LedgerError, Result};
pub use git::GitLedger;
pub use memory::MemoryLedger;

use async_trait::async_trait;

/// Identifier of a commit in the ledger.
pub type CommitId = String;

/// Branch, commit, merge, and read operations over the rule history.
///
/// Every mutating operation is atomic from the caller's point of view.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Name of the trunk branch.
    fn trunk(&self) -> &str;

    /// Create `name` pointing at the head of `from`.
    async fn create_branch(&self, name: &str, from: &str) -> Result<()>;

    /// Apply `diff` on top of `branch` and commit it.
    async fn commit_diff(&self, branch: &str, diff: &str, message: &str) -> Result<CommitId>;

    /// Merge `branch` into `into`. On conflict `into` is unchanged.
    async fn merge(&self, branch: &str, into: &str, message: &str) -> Result<CommitId>;

    /// Contents of `path` at branch or commit `at`.
    async fn read_file(&self, path: &str, at: &str) -> Result<Vec<u8>>;

    /// Remove a branch.
    async fn delete_branch(&self, name: &str) -> Result<()>;

    /// Whether a branch exists.
    async fn branch_exists(&self, name: &str) -> Result<bool>;

    /// Diff of `branch` against its merge base with `base`.
    async fn diff_from(&self, branch: &str, base: &str) -> Result<String>;

    /// Whether the head of `branch` is already part of `into`.
    async fn is_merged(&self, branch: &str, into: &str) -> Result<bool>;

    /// Whether `commit` is part of the history of `on`.
    async fn contains_commit(&self, commit: &str, on: &str) -> Result<bool>;

    /// Head commit of a branch.
    async fn head(&self, branch: &str) -> Result<CommitId>;
}

/// Check a branch name before handing it to a backend.
///
/// Accepts alphanumerics and `-_./`, rejects leading `-` (flag injection),
/// `..` sequences, and trailing `/` or `.lock`.
pub fn validate_ref(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidRef(name.to_string()))
    }
}
