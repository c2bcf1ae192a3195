//! In-process ledger with content-addressed commits.
//!
//! Commits are immutable file snapshots identified by a BLAKE3 hash of their
//! parents, message and contents. Merges are three-way at file granularity:
//! a file changed on both sides since the merge base, to different contents,
//! is a conflict.

use crate::error::{LedgerError, Result};
use crate::{patch, validate_ref, CommitId, Ledger};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

type Files = Arc<BTreeMap<String, String>>;

#[derive(Debug, Clone)]
struct Commit {
    parents: Vec<CommitId>,
    files: Files,
}

#[derive(Debug, Default)]
struct LedgerState {
    commits: HashMap<CommitId, Commit>,
    branches: BTreeMap<String, CommitId>,
}

impl LedgerState {
    fn insert_commit(&mut self, parents: Vec<CommitId>, files: Files, message: &str) -> CommitId {
        let mut hasher = blake3::Hasher::new();
        for parent in &parents {
            hasher.update(parent.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(message.as_bytes());
        for (path, content) in files.iter() {
            hasher.update(path.as_bytes());
            hasher.update(&(content.len() as u64).to_le_bytes());
            hasher.update(content.as_bytes());
        }
        let id = hex::encode(hasher.finalize().as_bytes());
        self.commits.insert(id.clone(), Commit { parents, files });
        id
    }

    /// Resolve a branch name or commit id.
    fn resolve(&self, rev: &str) -> Result<CommitId> {
        if let Some(id) = self.branches.get(rev) {
            return Ok(id.clone());
        }
        if self.commits.contains_key(rev) {
            return Ok(rev.to_string());
        }
        Err(LedgerError::BranchNotFound(rev.to_string()))
    }

    fn files(&self, id: &str) -> Files {
        self.commits
            .get(id)
            .map(|c| Arc::clone(&c.files))
            .unwrap_or_default()
    }

    fn ancestors(&self, id: &str) -> HashSet<CommitId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&next) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        seen
    }

    fn is_ancestor(&self, ancestor: &str, of: &str) -> bool {
        self.ancestors(of).contains(ancestor)
    }

    /// Nearest common ancestor, searching breadth-first from `a`.
    fn merge_base(&self, a: &str, b: &str) -> Option<CommitId> {
        let of_b = self.ancestors(b);
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([a.to_string()]);
        while let Some(next) = queue.pop_front() {
            if of_b.contains(&next) {
                return Some(next);
            }
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&next) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        None
    }
}

/// Ledger kept entirely in memory.
#[derive(Debug)]
pub struct MemoryLedger {
    trunk: String,
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Create a ledger whose trunk holds `files` in its initial commit.
    pub fn new<I, P, C>(trunk: &str, files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let files: BTreeMap<String, String> =
            files.into_iter().map(|(p, c)| (p.into(), c.into())).collect();
        let mut state = LedgerState::default();
        let root = state.insert_commit(Vec::new(), Arc::new(files), "Initial commit with Nomic rules");
        state.branches.insert(trunk.to_string(), root);
        Self {
            trunk: trunk.to_string(),
            state: Mutex::new(state),
        }
    }

    /// Create an empty ledger.
    pub fn empty(trunk: &str) -> Self {
        Self::new(trunk, Vec::<(String, String)>::new())
    }

    /// Names of all branches.
    pub fn branches(&self) -> Vec<String> {
        self.lock().branches.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // Commits are inserted whole; a poisoned state is still consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn trunk(&self) -> &str {
        &self.trunk
    }

    async fn create_branch(&self, name: &str, from: &str) -> Result<()> {
        validate_ref(name)?;
        let mut state = self.lock();
        if state.branches.contains_key(name) {
            return Err(LedgerError::BranchExists(name.to_string()));
        }
        let head = state.resolve(from)?;
        state.branches.insert(name.to_string(), head);
        Ok(())
    }

    async fn commit_diff(&self, branch: &str, diff: &str, message: &str) -> Result<CommitId> {
        let mut state = self.lock();
        let head = state
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| LedgerError::BranchNotFound(branch.to_string()))?;
        let next = patch::apply(&state.files(&head), diff)?;
        let id = state.insert_commit(vec![head], Arc::new(next), message);
        state.branches.insert(branch.to_string(), id.clone());
        Ok(id)
    }

    async fn merge(&self, branch: &str, into: &str, message: &str) -> Result<CommitId> {
        let mut state = self.lock();
        let theirs = state
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| LedgerError::BranchNotFound(branch.to_string()))?;
        let ours = state
            .branches
            .get(into)
            .cloned()
            .ok_or_else(|| LedgerError::BranchNotFound(into.to_string()))?;

        if state.is_ancestor(&theirs, &ours) {
            return Ok(ours);
        }

        let base = state.merge_base(&ours, &theirs);
        let base_files = base.map(|b| state.files(&b)).unwrap_or_default();
        let our_files = state.files(&ours);
        let their_files = state.files(&theirs);

        let paths: BTreeSet<&String> = base_files
            .keys()
            .chain(our_files.keys())
            .chain(their_files.keys())
            .collect();

        let mut merged = BTreeMap::new();
        let mut conflicts = Vec::new();
        for path in paths {
            let b = base_files.get(path);
            let o = our_files.get(path);
            let t = their_files.get(path);
            let pick = if t == b || o == t {
                o
            } else if o == b {
                t
            } else {
                conflicts.push(path.clone());
                continue;
            };
            if let Some(content) = pick {
                merged.insert(path.clone(), content.clone());
            }
        }

        if !conflicts.is_empty() {
            return Err(LedgerError::MergeConflict {
                branch: branch.to_string(),
                detail: format!("conflicting files: {}", conflicts.join(", ")),
            });
        }

        let id = state.insert_commit(vec![ours, theirs], Arc::new(merged), message);
        state.branches.insert(into.to_string(), id.clone());
        Ok(id)
    }

    async fn read_file(&self, path: &str, at: &str) -> Result<Vec<u8>> {
        let state = self.lock();
        let id = state.resolve(at)?;
        state
            .files(&id)
            .get(path)
            .map(|c| c.as_bytes().to_vec())
            .ok_or_else(|| LedgerError::FileNotFound {
                path: path.to_string(),
                at: at.to_string(),
            })
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        if name == self.trunk {
            return Err(LedgerError::InvalidRef(format!("refusing to delete trunk {name}")));
        }
        let mut state = self.lock();
        state
            .branches
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| LedgerError::BranchNotFound(name.to_string()))
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock().branches.contains_key(name))
    }

    async fn diff_from(&self, branch: &str, base: &str) -> Result<String> {
        let state = self.lock();
        let head = state.resolve(branch)?;
        let base_head = state.resolve(base)?;
        let from = state
            .merge_base(&head, &base_head)
            .map(|b| state.files(&b))
            .unwrap_or_default();
        let to = state.files(&head);

        let paths: BTreeSet<&String> = from.keys().chain(to.keys()).collect();
        let mut diff = String::new();
        for path in paths {
            let old = from.get(path).map(String::as_str);
            let new = to.get(path).map(String::as_str);
            if old != new {
                diff.push_str(&patch::render_file_change(path, old, new));
            }
        }
        Ok(diff)
    }

    async fn is_merged(&self, branch: &str, into: &str) -> Result<bool> {
        let state = self.lock();
        let head = state.resolve(branch)?;
        let target = state.resolve(into)?;
        Ok(state.is_ancestor(&head, &target))
    }

    async fn contains_commit(&self, commit: &str, on: &str) -> Result<bool> {
        let state = self.lock();
        if !state.commits.contains_key(commit) {
            return Ok(false);
        }
        let target = state.resolve(on)?;
        Ok(state.is_ancestor(commit, &target))
    }

    async fn head(&self, branch: &str) -> Result<CommitId> {
        self.lock().resolve(branch)
    }
}
