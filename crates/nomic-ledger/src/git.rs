//! Ledger backed by a local git repository.
//!
//! All operations share one working tree, so they are serialized behind an
//! async mutex. Between operations the working tree is always checked out on
//! trunk; any operation that leaves trunk restores it before returning, on
//! success and on failure.

use crate::error::{LedgerError, Result};
use crate::{validate_ref, CommitId, Ledger};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const COMMITTER_NAME: &str = "Reality";
const COMMITTER_EMAIL: &str = "reality@nomic.local";

/// Git-backed ledger.
#[derive(Debug)]
pub struct GitLedger {
    repo: PathBuf,
    trunk: String,
    lock: Mutex<()>,
}

impl GitLedger {
    /// Open the repository at `repo`, initializing it with an initial commit
    /// of whatever files are present if it is not a git repository yet.
    pub async fn open<P: AsRef<Path>>(repo: P, trunk: &str) -> Result<Self> {
        validate_ref(trunk)?;
        let ledger = Self {
            repo: repo.as_ref().to_path_buf(),
            trunk: trunk.to_string(),
            lock: Mutex::new(()),
        };

        if !ledger.repo.join(".git").exists() {
            tokio::fs::create_dir_all(&ledger.repo).await?;
            ledger.git_ok(&["init", "-q", "-b", trunk]).await?;
            ledger.git_ok(&["add", "-A"]).await?;
            ledger
                .git_ok(&["commit", "-q", "--allow-empty", "-m", "Initial commit with Nomic rules"])
                .await?;
            info!(repo = ?ledger.repo, trunk, "Initialized rule ledger");
        } else {
            ledger.git_ok(&["checkout", "-q", trunk]).await?;
        }

        Ok(ledger)
    }

    /// Path of the repository.
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.repo)
            .args(["-c", &format!("user.name={COMMITTER_NAME}")])
            .args(["-c", &format!("user.email={COMMITTER_EMAIL}")])
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn git(&self, args: &[&str]) -> Result<Output> {
        debug!(?args, "git");
        Ok(self.command(args).output().await?)
    }

    async fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(LedgerError::Command(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn git_with_input(&self, args: &[&str], input: &[u8]) -> Result<Output> {
        let mut child = self.command(args).stdin(Stdio::piped()).spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
        }
        Ok(child.wait_with_output().await?)
    }

    async fn rev_exists(&self, rev: &str) -> Result<bool> {
        let spec = format!("{rev}^{{commit}}");
        Ok(self
            .git(&["rev-parse", "--verify", "--quiet", &spec])
            .await?
            .status
            .success())
    }

    async fn local_branch_exists(&self, name: &str) -> Result<bool> {
        let spec = format!("refs/heads/{name}");
        Ok(self
            .git(&["rev-parse", "--verify", "--quiet", &spec])
            .await?
            .status
            .success())
    }

    async fn rev_parse(&self, rev: &str) -> Result<CommitId> {
        Ok(self.git_ok(&["rev-parse", rev]).await?.trim().to_string())
    }

    /// Put the working tree back on a clean trunk.
    async fn restore_trunk(&self) {
        for args in [
            &["reset", "-q", "--hard"][..],
            &["checkout", "-q", "-f", self.trunk.as_str()][..],
        ] {
            if let Err(e) = self.git_ok(args).await {
                warn!("Failed to restore trunk checkout: {}", e);
            }
        }
    }

    async fn commit_on_branch(&self, branch: &str, diff: &str, message: &str) -> Result<CommitId> {
        self.git_ok(&["checkout", "-q", branch]).await?;

        let applied = self
            .git_with_input(&["apply", "--index", "--whitespace=nowarn", "-"], diff.as_bytes())
            .await?;
        if !applied.status.success() {
            return Err(LedgerError::PatchApplyFailed(
                String::from_utf8_lossy(&applied.stderr).trim().to_string(),
            ));
        }

        let committed = self.git(&["commit", "-q", "-m", message]).await?;
        if !committed.status.success() {
            return Err(LedgerError::PatchApplyFailed(
                "patch produced no changes".to_string(),
            ));
        }

        self.rev_parse("HEAD").await
    }

    async fn merge_into(&self, branch: &str, into: &str, message: &str) -> Result<CommitId> {
        self.git_ok(&["checkout", "-q", into]).await?;

        let merged = self.git(&["merge", "--no-ff", "-q", "-m", message, branch]).await?;
        if !merged.status.success() {
            let detail = format!(
                "{}{}",
                String::from_utf8_lossy(&merged.stdout).trim(),
                String::from_utf8_lossy(&merged.stderr).trim()
            );
            let _ = self.git(&["merge", "--abort"]).await;
            return Err(LedgerError::MergeConflict {
                branch: branch.to_string(),
                detail,
            });
        }

        self.rev_parse("HEAD").await
    }
}

#[async_trait]
impl Ledger for GitLedger {
    fn trunk(&self) -> &str {
        &self.trunk
    }

    async fn create_branch(&self, name: &str, from: &str) -> Result<()> {
        validate_ref(name)?;
        validate_ref(from)?;
        let _guard = self.lock.lock().await;
        if self.local_branch_exists(name).await? {
            return Err(LedgerError::BranchExists(name.to_string()));
        }
        if !self.rev_exists(from).await? {
            return Err(LedgerError::BranchNotFound(from.to_string()));
        }
        self.git_ok(&["branch", name, from]).await?;
        Ok(())
    }

    async fn commit_diff(&self, branch: &str, diff: &str, message: &str) -> Result<CommitId> {
        validate_ref(branch)?;
        let _guard = self.lock.lock().await;
        if !self.local_branch_exists(branch).await? {
            return Err(LedgerError::BranchNotFound(branch.to_string()));
        }
        let result = self.commit_on_branch(branch, diff, message).await;
        self.restore_trunk().await;
        result
    }

    async fn merge(&self, branch: &str, into: &str, message: &str) -> Result<CommitId> {
        validate_ref(branch)?;
        validate_ref(into)?;
        let _guard = self.lock.lock().await;
        for name in [branch, into] {
            if !self.local_branch_exists(name).await? {
                return Err(LedgerError::BranchNotFound(name.to_string()));
            }
        }
        let result = self.merge_into(branch, into, message).await;
        self.restore_trunk().await;
        result
    }

    async fn read_file(&self, path: &str, at: &str) -> Result<Vec<u8>> {
        validate_ref(at)?;
        if path.starts_with('-') || path.contains("..") {
            return Err(LedgerError::InvalidRef(path.to_string()));
        }
        let _guard = self.lock.lock().await;
        let spec = format!("{at}:{path}");
        let output = self.git(&["show", &spec]).await?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        if !self.rev_exists(at).await? {
            return Err(LedgerError::BranchNotFound(at.to_string()));
        }
        Err(LedgerError::FileNotFound {
            path: path.to_string(),
            at: at.to_string(),
        })
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        validate_ref(name)?;
        if name == self.trunk {
            return Err(LedgerError::InvalidRef(format!("refusing to delete trunk {name}")));
        }
        let _guard = self.lock.lock().await;
        if !self.local_branch_exists(name).await? {
            return Err(LedgerError::BranchNotFound(name.to_string()));
        }
        self.git_ok(&["branch", "-q", "-D", name]).await?;
        Ok(())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        validate_ref(name)?;
        let _guard = self.lock.lock().await;
        self.local_branch_exists(name).await
    }

    async fn diff_from(&self, branch: &str, base: &str) -> Result<String> {
        validate_ref(branch)?;
        validate_ref(base)?;
        let _guard = self.lock.lock().await;
        let range = format!("{base}...{branch}");
        self.git_ok(&["diff", &range]).await
    }

    async fn is_merged(&self, branch: &str, into: &str) -> Result<bool> {
        validate_ref(branch)?;
        validate_ref(into)?;
        let _guard = self.lock.lock().await;
        if !self.rev_exists(branch).await? {
            return Err(LedgerError::BranchNotFound(branch.to_string()));
        }
        let output = self.git(&["merge-base", "--is-ancestor", branch, into]).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(LedgerError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        }
    }

    async fn contains_commit(&self, commit: &str, on: &str) -> Result<bool> {
        if commit.is_empty() || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(false);
        }
        validate_ref(on)?;
        let _guard = self.lock.lock().await;
        if !self.rev_exists(commit).await? {
            return Ok(false);
        }
        let output = self.git(&["merge-base", "--is-ancestor", commit, on]).await?;
        Ok(output.status.success())
    }

    async fn head(&self, branch: &str) -> Result<CommitId> {
        validate_ref(branch)?;
        let _guard = self.lock.lock().await;
        if !self.rev_exists(branch).await? {
            return Err(LedgerError::BranchNotFound(branch.to_string()));
        }
        self.rev_parse(branch).await
    }
}
