//! Edit Plan Parser: turns a raw model response into a validated, ordered
//! sequence of file operations.
//!
//! The grammar here is the same one advertised to the model in
//! `gateway::OUTPUT_CONTRACT`; the two must stay in lockstep. Parsing is a
//! pure function over the response text and the session snapshot — it never
//! touches the filesystem.
//!
//! Grammar (one or more operation blocks, blank lines and `#` comments
//! between blocks are ignored):
//!
//! ```text
//! CREATE: <path>
//! <fenced content>
//!
//! REPLACE: <path>
//! <fenced content>
//!
//! REPLACE_REGION: <path>
//! MATCH:
//! <fenced text, must occur exactly once in the file>
//! WITH:
//! <fenced replacement>
//!
//! DELETE: <path>
//!
//! RENAME: <from> -> <to>
//! ```
//!
//! Fences are runs of three or more backticks with an optional language tag;
//! the closing fence must be at least as long as the opener.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::core::snapshot::{display_path, fence_for, Fingerprint, ProjectSnapshot, Roots};

/// A single parsed file mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOperation {
    CreateFile { path: PathBuf, content: String },
    ReplaceFile { path: PathBuf, content: String },
    ReplaceRegion {
        path: PathBuf,
        match_text: String,
        new_text: String,
    },
    DeleteFile { path: PathBuf },
    RenameFile { from: PathBuf, to: PathBuf },
}

impl EditOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            EditOperation::CreateFile { .. } => "CREATE",
            EditOperation::ReplaceFile { .. } => "REPLACE",
            EditOperation::ReplaceRegion { .. } => "REPLACE_REGION",
            EditOperation::DeleteFile { .. } => "DELETE",
            EditOperation::RenameFile { .. } => "RENAME",
        }
    }

    /// The path this operation is reported under (the target for renames).
    pub fn primary_path(&self) -> &Path {
        match self {
            EditOperation::CreateFile { path, .. }
            | EditOperation::ReplaceFile { path, .. }
            | EditOperation::ReplaceRegion { path, .. }
            | EditOperation::DeleteFile { path } => path,
            EditOperation::RenameFile { to, .. } => to,
        }
    }
}

/// Ordered operations plus the fingerprints captured when context was
/// gathered. Consumed exactly once by the applier.
#[derive(Debug)]
pub struct EditPlan {
    pub ops: Vec<EditOperation>,
    /// Fingerprint per referenced path that existed in the snapshot;
    /// a referenced path absent here is expected not to exist on disk.
    pub fingerprints: IndexMap<PathBuf, Fingerprint>,
    pub roots: Roots,
}

/// Grammar violations, with the offending line for corrective retry prompts.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("response contained no operations")]
    Empty,

    #[error("line {line}: unknown directive: {found}")]
    UnknownDirective { line: usize, found: String },

    #[error("line {line}: {tag} requires a path")]
    MissingPath { line: usize, tag: String },

    #[error("line {line}: expected a fenced content block")]
    MissingFence { line: usize },

    #[error("line {line}: fence opened here was never closed (truncated response?)")]
    UnterminatedFence { line: usize },

    #[error("line {line}: expected {field} block for REPLACE_REGION")]
    MissingField { line: usize, field: &'static str },

    #[error("line {line}: MATCH block for {path} is empty")]
    EmptyMatch { line: usize, path: String },

    #[error("line {line}: invalid path {path}: {reason}")]
    BadPath {
        line: usize,
        path: String,
        reason: String,
    },

    #[error("line {line}: {path} is not part of the gathered context")]
    UnknownFile { line: usize, path: String },

    #[error("line {line}: conflicting operations on {path}: {reason}")]
    PathConflict {
        line: usize,
        path: String,
        reason: String,
    },
}

/// What earlier plan operations did to a path, for intent-conflict checks.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PathState {
    Created,
    Replaced,
    RegionEdited,
    Deleted,
    RenamedAway,
    RenamedIn,
}

/// Parse and validate a model response against the session snapshot.
pub fn parse_plan(raw: &str, snapshot: &ProjectSnapshot) -> Result<EditPlan, ParseError> {
    let input = raw.replace('\r', "");
    let lines: Vec<&str> = input.lines().collect();

    let mut ops = Vec::new();
    let mut op_lines: Vec<usize> = Vec::new();
    let mut i = 0usize;
    while i < lines.len() {
        // Strip BOM once on the first line
        let line = if i == 0 {
            lines[i].trim_start_matches('\u{FEFF}').trim()
        } else {
            lines[i].trim()
        };

        if line.is_empty() || line.starts_with('#') {
            i += 1;
            continue;
        }

        let header_line = i + 1; // 1-based for error reporting
        op_lines.push(header_line);
        if let Some(rest) = line.strip_prefix("CREATE:") {
            let path = parse_path(rest, header_line, "CREATE")?;
            i += 1;
            let content = read_fenced_block(&lines, &mut i)?;
            ops.push(EditOperation::CreateFile { path, content });
        } else if let Some(rest) = line.strip_prefix("REPLACE_REGION:") {
            let path = parse_path(rest, header_line, "REPLACE_REGION")?;
            i += 1;
            expect_marker(&lines, &mut i, "MATCH:")?;
            let match_line = i + 1; // 1-based line of the fence opener
            let match_text = read_fenced_block(&lines, &mut i)?;
            if match_text.trim().is_empty() {
                return Err(ParseError::EmptyMatch {
                    line: match_line,
                    path: display_path(&path),
                });
            }
            expect_marker(&lines, &mut i, "WITH:")?;
            let new_text = read_fenced_block(&lines, &mut i)?;
            ops.push(EditOperation::ReplaceRegion {
                path,
                match_text,
                new_text,
            });
        } else if let Some(rest) = line.strip_prefix("REPLACE:") {
            let path = parse_path(rest, header_line, "REPLACE")?;
            i += 1;
            let content = read_fenced_block(&lines, &mut i)?;
            ops.push(EditOperation::ReplaceFile { path, content });
        } else if let Some(rest) = line.strip_prefix("DELETE:") {
            let path = parse_path(rest, header_line, "DELETE")?;
            i += 1;
            ops.push(EditOperation::DeleteFile { path });
        } else if let Some(rest) = line.strip_prefix("RENAME:") {
            let (from, to) = parse_rename(rest, header_line)?;
            i += 1;
            ops.push(EditOperation::RenameFile { from, to });
        } else {
            return Err(ParseError::UnknownDirective {
                line: header_line,
                found: line.chars().take(60).collect(),
            });
        }
    }

    if ops.is_empty() {
        return Err(ParseError::Empty);
    }

    validate_plan(&ops, &op_lines, snapshot)?;

    let fingerprints = referenced_fingerprints(&ops, snapshot);
    Ok(EditPlan {
        ops,
        fingerprints,
        roots: snapshot.roots.clone(),
    })
}

/// Render a plan back into the grammar (used for dry-run display and the
/// parse round-trip tests).
pub fn render_plan(plan: &EditPlan) -> String {
    let mut out = String::new();
    for op in &plan.ops {
        match op {
            EditOperation::CreateFile { path, content } => {
                let fence = fence_for(content);
                out.push_str(&format!(
                    "CREATE: {}\n{fence}\n{content}\n{fence}\n\n",
                    display_path(path)
                ));
            }
            EditOperation::ReplaceFile { path, content } => {
                let fence = fence_for(content);
                out.push_str(&format!(
                    "REPLACE: {}\n{fence}\n{content}\n{fence}\n\n",
                    display_path(path)
                ));
            }
            EditOperation::ReplaceRegion {
                path,
                match_text,
                new_text,
            } => {
                let mf = fence_for(match_text);
                let nf = fence_for(new_text);
                out.push_str(&format!(
                    "REPLACE_REGION: {}\nMATCH:\n{mf}\n{match_text}\n{mf}\nWITH:\n{nf}\n{new_text}\n{nf}\n\n",
                    display_path(path)
                ));
            }
            EditOperation::DeleteFile { path } => {
                out.push_str(&format!("DELETE: {}\n\n", display_path(path)));
            }
            EditOperation::RenameFile { from, to } => {
                out.push_str(&format!(
                    "RENAME: {} -> {}\n\n",
                    display_path(from),
                    display_path(to)
                ));
            }
        }
    }
    out
}

fn parse_path(rest: &str, line: usize, tag: &str) -> Result<PathBuf, ParseError> {
    let raw = rest.trim();
    if raw.is_empty() {
        return Err(ParseError::MissingPath {
            line,
            tag: tag.to_string(),
        });
    }
    normalize_path(raw, line)
}

fn parse_rename(rest: &str, line: usize) -> Result<(PathBuf, PathBuf), ParseError> {
    let raw = rest.trim();
    let Some((from, to)) = raw.split_once("->") else {
        return Err(ParseError::BadPath {
            line,
            path: raw.to_string(),
            reason: "RENAME requires '<from> -> <to>'".into(),
        });
    };
    Ok((normalize_path(from.trim(), line)?, normalize_path(to.trim(), line)?))
}

/// Normalize a model-supplied path: forward slashes, no absolute paths,
/// drive letters, tildes, or parent traversal.
fn normalize_path(raw: &str, line: usize) -> Result<PathBuf, ParseError> {
    let bad = |reason: &str| ParseError::BadPath {
        line,
        path: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw.contains('\0') || raw.chars().any(|c| c.is_control()) {
        return Err(bad("contains control characters"));
    }
    let norm = raw.replace('\\', "/");
    let trimmed = norm.trim().trim_start_matches("./");
    if trimmed.is_empty() || trimmed == "." {
        return Err(bad("empty path"));
    }
    if trimmed.starts_with('/') {
        return Err(bad("absolute paths are not allowed"));
    }
    if trimmed.len() >= 2 && trimmed.as_bytes()[1] == b':' {
        return Err(bad("drive letters are not allowed"));
    }
    if trimmed.starts_with('~') {
        return Err(bad("tilde expansion is not allowed"));
    }
    let mut out = PathBuf::new();
    for seg in trimmed.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        if seg == ".." {
            return Err(bad("parent traversal is not allowed"));
        }
        out.push(seg);
    }
    if out.as_os_str().is_empty() {
        return Err(bad("empty path"));
    }
    Ok(out)
}

fn expect_marker(lines: &[&str], i: &mut usize, marker: &str) -> Result<(), ParseError> {
    // Tolerate blank lines before the marker
    while *i < lines.len() && lines[*i].trim().is_empty() {
        *i += 1;
    }
    if *i >= lines.len() || !lines[*i].trim().eq_ignore_ascii_case(marker) {
        return Err(ParseError::MissingField {
            line: *i + 1,
            field: if marker == "MATCH:" { "MATCH:" } else { "WITH:" },
        });
    }
    *i += 1;
    Ok(())
}

/// Read a fenced content block starting at (or just after blank lines from)
/// the current position. The closing fence must be a backtick run at least
/// as long as the opener.
fn read_fenced_block(lines: &[&str], i: &mut usize) -> Result<String, ParseError> {
    while *i < lines.len() && lines[*i].trim().is_empty() {
        *i += 1;
    }
    if *i >= lines.len() {
        return Err(ParseError::MissingFence { line: *i });
    }
    let open = lines[*i].trim_start();
    if !open.starts_with("```") {
        return Err(ParseError::MissingFence { line: *i + 1 });
    }
    let fence_len = open.chars().take_while(|&c| c == '`').count();
    let open_line = *i + 1;
    *i += 1;

    let mut body: Vec<&str> = Vec::new();
    while *i < lines.len() {
        let t = lines[*i].trim_start();
        let run = t.chars().take_while(|&c| c == '`').count();
        if run >= fence_len && t.chars().all(|c| c == '`' || c.is_whitespace()) {
            *i += 1; // consume closing fence
            return Ok(body.join("\n"));
        }
        body.push(lines[*i]);
        *i += 1;
    }
    // EOF without a closing fence means the response was cut off
    Err(ParseError::UnterminatedFence { line: open_line })
}

/// Per-path intent validation across the whole plan. Delete-then-create is
/// the only permitted reuse of a path by two mutating operations; region
/// edits may repeat and may follow a rename of the same file.
fn validate_plan(
    ops: &[EditOperation],
    op_lines: &[usize],
    snapshot: &ProjectSnapshot,
) -> Result<(), ParseError> {
    let mut states: HashMap<String, PathState> = HashMap::new();
    let in_snapshot = |p: &Path| snapshot.entries.contains_key(p);

    let conflict = |line: usize, p: &Path, reason: &str| ParseError::PathConflict {
        line,
        path: display_path(p),
        reason: reason.to_string(),
    };

    for (idx, op) in ops.iter().enumerate() {
        let line = op_lines.get(idx).copied().unwrap_or(idx + 1);
        // Containment against the scanned roots
        for p in op_paths(op) {
            snapshot
                .roots
                .resolve(p)
                .map_err(|reason| ParseError::BadPath {
                    line,
                    path: display_path(p),
                    reason,
                })?;
        }

        match op {
            EditOperation::CreateFile { path, .. } => {
                let key = display_path(path);
                match states.get(&key) {
                    None | Some(PathState::Deleted) | Some(PathState::RenamedAway) => {
                        states.insert(key, PathState::Created);
                    }
                    Some(_) => {
                        return Err(conflict(line, path, "create after an earlier create/edit"));
                    }
                }
            }
            EditOperation::ReplaceFile { path, .. } => {
                let key = display_path(path);
                match states.get(&key) {
                    None => {
                        if !in_snapshot(path) {
                            return Err(ParseError::UnknownFile {
                                line,
                                path: key,
                            });
                        }
                        states.insert(key, PathState::Replaced);
                    }
                    Some(_) => {
                        return Err(conflict(
                            line,
                            path,
                            "whole-file replace cannot follow another operation",
                        ));
                    }
                }
            }
            EditOperation::ReplaceRegion { path, .. } => {
                let key = display_path(path);
                match states.get(&key) {
                    None => {
                        if !in_snapshot(path) {
                            return Err(ParseError::UnknownFile {
                                line,
                                path: key,
                            });
                        }
                        states.insert(key, PathState::RegionEdited);
                    }
                    // Several region edits on one file are fine, and a file
                    // renamed earlier in the plan may be edited by new name.
                    Some(PathState::RegionEdited) | Some(PathState::RenamedIn) => {
                        states.insert(key, PathState::RegionEdited);
                    }
                    Some(_) => {
                        return Err(conflict(
                            line,
                            path,
                            "region edit conflicts with an earlier operation",
                        ));
                    }
                }
            }
            EditOperation::DeleteFile { path } => {
                let key = display_path(path);
                match states.get(&key) {
                    None => {
                        if !in_snapshot(path) {
                            return Err(ParseError::UnknownFile {
                                line,
                                path: key,
                            });
                        }
                        states.insert(key, PathState::Deleted);
                    }
                    Some(_) => {
                        return Err(conflict(line, path, "delete after an earlier operation"));
                    }
                }
            }
            EditOperation::RenameFile { from, to } => {
                let from_key = display_path(from);
                let to_key = display_path(to);
                match states.get(&from_key) {
                    None => {
                        if !in_snapshot(from) {
                            return Err(ParseError::UnknownFile {
                                line,
                                path: from_key.clone(),
                            });
                        }
                    }
                    Some(_) => {
                        return Err(conflict(line, from, "rename source already operated on"));
                    }
                }
                match states.get(&to_key) {
                    None => {
                        if in_snapshot(to) {
                            return Err(conflict(line, to, "rename target already exists"));
                        }
                    }
                    Some(PathState::Deleted) | Some(PathState::RenamedAway) => {}
                    Some(_) => {
                        return Err(conflict(line, to, "rename target already operated on"));
                    }
                }
                states.insert(from_key, PathState::RenamedAway);
                states.insert(to_key, PathState::RenamedIn);
            }
        }
    }
    Ok(())
}

fn op_paths(op: &EditOperation) -> Vec<&Path> {
    match op {
        EditOperation::CreateFile { path, .. }
        | EditOperation::ReplaceFile { path, .. }
        | EditOperation::ReplaceRegion { path, .. }
        | EditOperation::DeleteFile { path } => vec![path],
        EditOperation::RenameFile { from, to } => vec![from, to],
    }
}

fn referenced_fingerprints(
    ops: &[EditOperation],
    snapshot: &ProjectSnapshot,
) -> IndexMap<PathBuf, Fingerprint> {
    let mut out = IndexMap::new();
    for op in ops {
        for p in op_paths(op) {
            if let Some(entry) = snapshot.entries.get(p) {
                out.insert(p.to_path_buf(), entry.fingerprint);
            }
        }
    }
    out
}
