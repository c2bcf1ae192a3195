//! Unified diff parsing and exact-context application.
//!
//! Handles the subset of `git diff` output the game produces: file headers
//! (`--- a/x`, `+++ b/x`, `/dev/null` for creation and deletion), hunks with
//! optional counts, and `\ No newline at end of file` markers. Extended
//! headers (`diff --git`, `index`, mode lines) are skipped.
//!
//! Application is strict: every context and removed line must match at the
//! position the hunk header names. There is no fuzz.

use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from parsing or applying a diff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("malformed diff: {0}")]
    Malformed(String),

    #[error("hunk {hunk} does not match {path}")]
    Mismatch { path: String, hunk: usize },

    #[error("{0} does not exist")]
    MissingFile(String),

    #[error("{0} already exists")]
    FileExists(String),

    #[error("diff contains no file changes")]
    Empty,
}

/// One line inside a hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

/// A contiguous change within one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

/// All hunks for one file. `None` paths mean `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    /// The path this patch is reported under.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }
}

/// Parse a unified diff into per-file patches.
pub fn parse(diff: &str) -> Result<Vec<FilePatch>, PatchError> {
    let mut files = Vec::new();
    let mut lines = diff.lines().peekable();

    while let Some(line) = lines.next() {
        let Some(old_header) = line.strip_prefix("--- ") else {
            continue;
        };
        let new_header = lines
            .next()
            .and_then(|l| l.strip_prefix("+++ "))
            .ok_or_else(|| PatchError::Malformed("'---' header without '+++'".into()))?;

        let mut file = FilePatch {
            old_path: header_path(old_header),
            new_path: header_path(new_header),
            hunks: Vec::new(),
        };
        if file.old_path.is_none() && file.new_path.is_none() {
            return Err(PatchError::Malformed("both sides are /dev/null".into()));
        }

        while let Some(next) = lines.peek() {
            if !next.starts_with("@@") {
                break;
            }
            let header = lines.next().unwrap_or_default();
            let mut hunk = parse_hunk_header(header)?;

            let (mut old_seen, mut new_seen) = (0, 0);
            while old_seen < hunk.old_len || new_seen < hunk.new_len {
                let body = lines
                    .next()
                    .ok_or_else(|| PatchError::Malformed(format!("truncated hunk in {}", file.path())))?;
                match body.chars().next() {
                    Some(' ') => {
                        hunk.lines.push(HunkLine::Context(body[1..].to_string()));
                        old_seen += 1;
                        new_seen += 1;
                    }
                    // Some tools strip the leading space from blank context lines
                    None => {
                        hunk.lines.push(HunkLine::Context(String::new()));
                        old_seen += 1;
                        new_seen += 1;
                    }
                    Some('-') => {
                        hunk.lines.push(HunkLine::Remove(body[1..].to_string()));
                        old_seen += 1;
                    }
                    Some('+') => {
                        hunk.lines.push(HunkLine::Add(body[1..].to_string()));
                        new_seen += 1;
                    }
                    Some('\\') => {}
                    Some(_) => {
                        return Err(PatchError::Malformed(format!(
                            "unexpected hunk line in {}: {:?}",
                            file.path(),
                            body
                        )))
                    }
                }
            }
            while lines.peek().is_some_and(|l| l.starts_with('\\')) {
                lines.next();
            }
            file.hunks.push(hunk);
        }

        files.push(file);
    }

    Ok(files)
}

/// Paths a diff touches (both sides of renames), in order of appearance.
///
/// Falls back to `diff --git` headers when the body does not parse, so a
/// malformed payload still reports what it meant to touch.
pub fn touched_paths(diff: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut push = |p: &str| {
        if !paths.iter().any(|existing: &String| existing == p) {
            paths.push(p.to_string());
        }
    };

    match parse(diff) {
        Ok(files) => {
            for file in &files {
                if let Some(ref old) = file.old_path {
                    push(old);
                }
                if let Some(ref new) = file.new_path {
                    push(new);
                }
            }
        }
        Err(_) => {
            for line in diff.lines() {
                if let Some(rest) = line.strip_prefix("diff --git ") {
                    for part in rest.split_whitespace() {
                        if let Some(p) = header_path(part) {
                            push(&p);
                        }
                    }
                }
            }
        }
    }

    paths
}

/// Apply a diff to a snapshot of files, returning the new snapshot.
pub fn apply(
    files: &BTreeMap<String, String>,
    diff: &str,
) -> Result<BTreeMap<String, String>, PatchError> {
    let patches = parse(diff)?;
    if patches.is_empty() {
        return Err(PatchError::Empty);
    }

    let mut out = files.clone();
    for patch in patches {
        match (patch.old_path.as_deref(), patch.new_path.as_deref()) {
            (None, Some(new)) => {
                if out.contains_key(new) {
                    return Err(PatchError::FileExists(new.to_string()));
                }
                let content = apply_hunks(new, &[], &patch.hunks)?;
                out.insert(new.to_string(), content);
            }
            (Some(old), None) => {
                let current = out
                    .get(old)
                    .ok_or_else(|| PatchError::MissingFile(old.to_string()))?;
                apply_hunks(old, &split_lines(current), &patch.hunks)?;
                out.remove(old);
            }
            (Some(old), Some(new)) => {
                let current = out
                    .get(old)
                    .ok_or_else(|| PatchError::MissingFile(old.to_string()))?;
                let content = apply_hunks(old, &split_lines(current), &patch.hunks)?;
                if old != new {
                    out.remove(old);
                }
                out.insert(new.to_string(), content);
            }
            (None, None) => {
                return Err(PatchError::Malformed("both sides are /dev/null".into()))
            }
        }
    }

    Ok(out)
}

/// Render a whole-file change as a unified diff section.
pub fn render_file_change(path: &str, old: Option<&str>, new: Option<&str>) -> String {
    let old_lines = old.map(split_lines).unwrap_or_default();
    let new_lines = new.map(split_lines).unwrap_or_default();

    let mut out = format!("diff --git a/{path} b/{path}\n");
    out.push_str(&match old {
        Some(_) => format!("--- a/{path}\n"),
        None => "--- /dev/null\n".to_string(),
    });
    out.push_str(&match new {
        Some(_) => format!("+++ b/{path}\n"),
        None => "+++ /dev/null\n".to_string(),
    });
    let old_start = usize::from(!old_lines.is_empty());
    let new_start = usize::from(!new_lines.is_empty());
    out.push_str(&format!(
        "@@ -{},{} +{},{} @@\n",
        old_start,
        old_lines.len(),
        new_start,
        new_lines.len()
    ));
    for line in &old_lines {
        out.push('-');
        out.push_str(line);
        out.push('\n');
    }
    for line in &new_lines {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn apply_hunks(path: &str, original: &[String], hunks: &[Hunk]) -> Result<String, PatchError> {
    let mut result: Vec<String> = Vec::with_capacity(original.len());
    let mut cursor = 0;

    for (index, hunk) in hunks.iter().enumerate() {
        let mismatch = || PatchError::Mismatch {
            path: path.to_string(),
            hunk: index + 1,
        };
        // A pure insertion names the line it follows; otherwise the first line it covers
        let start = if hunk.old_len == 0 {
            hunk.old_start
        } else {
            hunk.old_start.checked_sub(1).ok_or_else(mismatch)?
        };
        if start < cursor || start > original.len() {
            return Err(mismatch());
        }
        result.extend_from_slice(&original[cursor..start]);

        let mut pos = start;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(text) => {
                    if original.get(pos) != Some(text) {
                        return Err(mismatch());
                    }
                    result.push(text.clone());
                    pos += 1;
                }
                HunkLine::Remove(text) => {
                    if original.get(pos) != Some(text) {
                        return Err(mismatch());
                    }
                    pos += 1;
                }
                HunkLine::Add(text) => result.push(text.clone()),
            }
        }
        cursor = pos;
    }
    result.extend_from_slice(&original[cursor..]);

    if result.is_empty() {
        Ok(String::new())
    } else {
        Ok(result.join("\n") + "\n")
    }
}

fn split_lines(content: &str) -> Vec<String> {
    content.lines().map(str::to_string).collect()
}

fn header_path(raw: &str) -> Option<String> {
    // git may append a tab and timestamp after the path
    let raw = raw.split('\t').next().unwrap_or_default().trim();
    if raw == "/dev/null" {
        return None;
    }
    let path = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(path.to_string())
}

fn parse_hunk_header(header: &str) -> Result<Hunk, PatchError> {
    let malformed = || PatchError::Malformed(format!("bad hunk header: {header}"));
    let inner = header
        .strip_prefix("@@ ")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(malformed)?;
    let mut parts = inner.split_whitespace();
    let old = parts.next().and_then(|p| p.strip_prefix('-')).ok_or_else(malformed)?;
    let new = parts.next().and_then(|p| p.strip_prefix('+')).ok_or_else(malformed)?;
    let (old_start, old_len) = parse_range(old).ok_or_else(malformed)?;
    let (new_start, new_len) = parse_range(new).ok_or_else(malformed)?;
    Ok(Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
        lines: Vec::new(),
    })
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}
