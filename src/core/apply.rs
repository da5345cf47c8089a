//! Edit Applier: validated plan in, atomically mutated working tree out.
//!
//! Application is two-phase. Phase one re-reads every file the plan touches
//! and compares fingerprints against the snapshot; any drift aborts the whole
//! plan before a single byte is written. Phase two applies operations in plan
//! order, stashing the prior state of each touched path so a mid-plan failure
//! can restore the tree byte-for-byte.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, instrument, warn};

use crate::core::errors::EngineError;
use crate::core::plan::{EditOperation, EditPlan};
use crate::core::snapshot::{display_path, fingerprint, normalize_text, Fingerprint};
use crate::infra::io::{read_file_smart, write_atomic};

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Replace the first occurrence on an ambiguous region match instead of
    /// failing the operation.
    pub allow_first_match: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Applied,
    /// The operation would not have changed the file (idempotent create,
    /// replace with identical content).
    SkippedUnchanged,
}

/// Per-operation record for the session summary.
#[derive(Debug, Clone)]
pub struct OpReport {
    pub kind: &'static str,
    pub path: String,
    pub outcome: OpOutcome,
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub ops: Vec<OpReport>,
}

impl ApplyReport {
    pub fn applied(&self) -> usize {
        self.ops
            .iter()
            .filter(|r| r.outcome == OpOutcome::Applied)
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.ops
            .iter()
            .filter(|r| r.outcome == OpOutcome::SkippedUnchanged)
            .count()
    }
}

/// Prior state of a path, captured before its first mutation. `None` means
/// the path did not exist.
struct StashEntry {
    abs: PathBuf,
    prior: Option<Vec<u8>>,
}

/// Apply a plan to the working tree. On conflict nothing is written; on a
/// mid-plan failure every mutation is rolled back before returning.
#[instrument(skip_all, fields(ops = plan.ops.len()))]
pub fn apply_plan(plan: &EditPlan, options: ApplyOptions) -> Result<ApplyReport, EngineError> {
    detect_conflicts(plan)?;

    let mut stash: Vec<StashEntry> = Vec::new();
    let mut stashed: HashSet<PathBuf> = HashSet::new();
    let mut created_dirs: Vec<PathBuf> = Vec::new();
    let mut report = ApplyReport::default();

    for op in &plan.ops {
        match apply_one(plan, op, options, &mut stash, &mut stashed, &mut created_dirs) {
            Ok(outcome) => {
                debug!(kind = op.kind(), path = %display_path(op.primary_path()), ?outcome, "operation applied");
                report.ops.push(OpReport {
                    kind: op.kind(),
                    path: display_path(op.primary_path()),
                    outcome,
                });
            }
            Err(reason) => {
                error!(kind = op.kind(), path = %display_path(op.primary_path()), %reason, "operation failed; rolling back");
                rollback(&stash, &created_dirs);
                return Err(EngineError::RolledBack {
                    path: op.primary_path().to_path_buf(),
                    reason,
                });
            }
        }
    }

    Ok(report)
}

/// Phase one: compare every referenced on-disk file against the snapshot
/// fingerprints the plan carries. Collects all drifted paths so the user
/// sees the full conflict set at once.
fn detect_conflicts(plan: &EditPlan) -> Result<(), EngineError> {
    let mut conflicts: Vec<PathBuf> = Vec::new();

    for (path, expected) in &plan.fingerprints {
        let abs = resolve(plan, path)?;
        match disk_fingerprint(&abs) {
            Some(actual) if actual == *expected => {}
            Some(_) => conflicts.push(path.clone()),
            // Referenced file vanished since the snapshot
            None => conflicts.push(path.clone()),
        }
    }

    // Creates of files absent from the snapshot, and rename targets, must not
    // collide with anything that appeared on disk since the scan. Paths a
    // prior plan operation removes are exempt.
    let mut gone: HashSet<&Path> = HashSet::new();
    for op in &plan.ops {
        match op {
            EditOperation::CreateFile { path, content } => {
                if !gone.contains(path.as_path()) && !plan.fingerprints.contains_key(path) {
                    let abs = resolve(plan, path)?;
                    match disk_fingerprint(&abs) {
                        None => {}
                        // An identical file is an idempotent create, handled
                        // in phase two; anything else is drift.
                        Some(actual) if actual == fingerprint(content) => {}
                        Some(_) => conflicts.push(path.clone()),
                    }
                }
                gone.remove(path.as_path());
            }
            EditOperation::DeleteFile { path } => {
                gone.insert(path.as_path());
            }
            EditOperation::RenameFile { from, to } => {
                if !gone.contains(to.as_path()) && resolve(plan, to)?.exists() {
                    conflicts.push(to.clone());
                }
                gone.insert(from.as_path());
                gone.remove(to.as_path());
            }
            _ => {}
        }
    }

    conflicts.dedup();
    if conflicts.is_empty() {
        Ok(())
    } else {
        warn!(count = conflicts.len(), "fingerprint drift detected; aborting before any write");
        Err(EngineError::ConflictDetected { paths: conflicts })
    }
}

fn apply_one(
    plan: &EditPlan,
    op: &EditOperation,
    options: ApplyOptions,
    stash: &mut Vec<StashEntry>,
    stashed: &mut HashSet<PathBuf>,
    created_dirs: &mut Vec<PathBuf>,
) -> Result<OpOutcome, String> {
    match op {
        EditOperation::CreateFile { path, content } => {
            let abs = resolve_op(plan, path)?;
            if abs.exists() {
                let current = fs::read_to_string(&abs).map_err(|e| e.to_string())?;
                if fingerprint(&current) == fingerprint(content) {
                    return Ok(OpOutcome::SkippedUnchanged);
                }
                return Err("file already exists with different content".to_string());
            }
            stash_path(&abs, stash, stashed);
            ensure_parent(&abs, created_dirs)?;
            write_atomic(&abs, content.as_bytes()).map_err(|e| format!("{e:#}"))?;
            Ok(OpOutcome::Applied)
        }
        EditOperation::ReplaceFile { path, content } => {
            let abs = resolve_op(plan, path)?;
            let current = read_file_smart(&abs)
                .map_err(|e| format!("cannot read file to replace: {e:#}"))?;
            let current: &str = current.as_ref();
            if fingerprint(current) == fingerprint(content) {
                return Ok(OpOutcome::SkippedUnchanged);
            }
            stash_path(&abs, stash, stashed);
            write_atomic(&abs, content.as_bytes()).map_err(|e| format!("{e:#}"))?;
            Ok(OpOutcome::Applied)
        }
        EditOperation::ReplaceRegion {
            path,
            match_text,
            new_text,
        } => {
            let abs = resolve_op(plan, path)?;
            let current =
                read_file_smart(&abs).map_err(|e| format!("cannot read file to edit: {e:#}"))?;
            let current: &str = current.as_ref();
            let updated = replace_region(current, match_text, new_text, options)?;
            if updated == current {
                return Ok(OpOutcome::SkippedUnchanged);
            }
            stash_path(&abs, stash, stashed);
            write_atomic(&abs, updated.as_bytes()).map_err(|e| format!("{e:#}"))?;
            Ok(OpOutcome::Applied)
        }
        EditOperation::DeleteFile { path } => {
            let abs = resolve_op(plan, path)?;
            if !abs.exists() {
                return Err("file to delete does not exist".to_string());
            }
            stash_path(&abs, stash, stashed);
            fs::remove_file(&abs).map_err(|e| e.to_string())?;
            Ok(OpOutcome::Applied)
        }
        EditOperation::RenameFile { from, to } => {
            let abs_from = resolve_op(plan, from)?;
            let abs_to = resolve_op(plan, to)?;
            if !abs_from.exists() {
                return Err("rename source does not exist".to_string());
            }
            if abs_to.exists() {
                return Err("rename target already exists".to_string());
            }
            stash_path(&abs_from, stash, stashed);
            stash_path(&abs_to, stash, stashed);
            ensure_parent(&abs_to, created_dirs)?;
            if fs::rename(&abs_from, &abs_to).is_err() {
                // Cross-device rename; fall back to copy + remove
                fs::copy(&abs_from, &abs_to).map_err(|e| e.to_string())?;
                fs::remove_file(&abs_from).map_err(|e| e.to_string())?;
            }
            Ok(OpOutcome::Applied)
        }
    }
}

/// Single-occurrence region substitution. Ambiguous matches fail unless
/// first-match mode is enabled. When the exact match fails, the file and the
/// match text are retried under the fingerprint normalization so CRLF line
/// endings and trailing whitespace never block an otherwise valid edit; the
/// edited file is then written with normalized lines.
fn replace_region(
    current: &str,
    match_text: &str,
    new_text: &str,
    options: ApplyOptions,
) -> Result<String, String> {
    if current.contains(match_text) {
        return splice(current, match_text, new_text, options);
    }

    let canonical = normalize_text(current);
    let needle = normalize_text(match_text);
    let mut updated = splice(&canonical, &needle, new_text, options)?;
    if current.ends_with('\n') && !updated.ends_with('\n') {
        updated.push('\n');
    }
    Ok(updated)
}

fn splice(
    current: &str,
    match_text: &str,
    new_text: &str,
    options: ApplyOptions,
) -> Result<String, String> {
    match current.matches(match_text).count() {
        0 => Err("match text not found in file".to_string()),
        1 => Ok(current.replacen(match_text, new_text, 1)),
        n if options.allow_first_match => {
            warn!(occurrences = n, "ambiguous match; replacing first occurrence");
            Ok(current.replacen(match_text, new_text, 1))
        }
        n => Err(format!(
            "match text occurs {n} times; refusing an ambiguous edit"
        )),
    }
}

fn resolve(plan: &EditPlan, rel: &Path) -> Result<PathBuf, EngineError> {
    plan.roots
        .resolve(rel)
        .map_err(|reason| EngineError::Internal(anyhow::anyhow!(reason)))
}

fn resolve_op(plan: &EditPlan, rel: &Path) -> Result<PathBuf, String> {
    plan.roots.resolve(rel)
}

/// Create the parent directory chain for a write target. The topmost
/// ancestor that did not exist beforehand is recorded so rollback can remove
/// the whole created chain.
fn ensure_parent(abs: &Path, created_dirs: &mut Vec<PathBuf>) -> Result<(), String> {
    let Some(parent) = abs.parent() else {
        return Ok(());
    };
    if parent.exists() {
        return Ok(());
    }
    let mut top = parent.to_path_buf();
    while let Some(above) = top.parent() {
        if above.as_os_str().is_empty() || above.exists() {
            break;
        }
        top = above.to_path_buf();
    }
    fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    created_dirs.push(top);
    Ok(())
}

/// Record the prior state of a path the first time the plan touches it.
fn stash_path(abs: &Path, stash: &mut Vec<StashEntry>, stashed: &mut HashSet<PathBuf>) {
    if !stashed.insert(abs.to_path_buf()) {
        return;
    }
    let prior = fs::read(abs).ok();
    stash.push(StashEntry {
        abs: abs.to_path_buf(),
        prior,
    });
}

/// Restore every stashed path in reverse order, then remove any directory
/// chains the plan created. Best-effort: a rollback failure is logged but
/// cannot be recovered from here.
fn rollback(stash: &[StashEntry], created_dirs: &[PathBuf]) {
    for entry in stash.iter().rev() {
        let result = match &entry.prior {
            Some(bytes) => write_atomic(&entry.abs, bytes).map_err(|e| format!("{e:#}")),
            None => {
                if entry.abs.exists() {
                    fs::remove_file(&entry.abs).map_err(|e| e.to_string())
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            error!(path = %entry.abs.display(), error = %e, "rollback failed for path");
        }
    }
    for dir in created_dirs.iter().rev() {
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(dir) {
                error!(path = %dir.display(), error = %e, "rollback failed to remove created directory");
            }
        }
    }
}

/// Disk fingerprint using the same scheme the snapshot applies: normalized
/// text hash for UTF-8 files, raw byte hash otherwise.
pub(crate) fn disk_fingerprint(abs: &Path) -> Option<Fingerprint> {
    let bytes = fs::read(abs).ok()?;
    Some(match String::from_utf8(bytes) {
        Ok(text) => fingerprint(&text),
        Err(e) => xxhash_rust::xxh64::xxh64(e.as_bytes(), 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::parse_plan;
    use crate::core::snapshot::ProjectSnapshot;
    use crate::infra::config::Config;
    use tempfile::TempDir;

    fn setup(files: &[(&str, &str)]) -> (TempDir, ProjectSnapshot) {
        let tmp = TempDir::new().unwrap();
        for (rel, body) in files {
            let p = tmp.path().join(rel);
            if let Some(parent) = p.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(p, body).unwrap();
        }
        let snap =
            ProjectSnapshot::build(&[tmp.path().to_path_buf()], &Config::default()).unwrap();
        (tmp, snap)
    }

    #[test]
    fn test_create_replace_delete_roundtrip() {
        let (tmp, snap) = setup(&[("a.txt", "old a\n"), ("b.txt", "bye\n")]);
        let raw = "CREATE: sub/new.txt\n```\nfresh\n```\n\nREPLACE: a.txt\n```\nnew a\n```\n\nDELETE: b.txt\n";
        let plan = parse_plan(raw, &snap).unwrap();
        let report = apply_plan(&plan, ApplyOptions::default()).unwrap();

        assert_eq!(report.applied(), 3);
        assert_eq!(fs::read_to_string(tmp.path().join("sub/new.txt")).unwrap(), "fresh");
        assert_eq!(fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "new a");
        assert!(!tmp.path().join("b.txt").exists());
    }

    #[test]
    fn test_region_edit_applies_once() {
        let (tmp, snap) = setup(&[("code.rs", "fn a() {}\nfn b() {}\n")]);
        let raw = "REPLACE_REGION: code.rs\nMATCH:\n```\nfn b() {}\n```\nWITH:\n```\nfn b() { panic!() }\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        apply_plan(&plan, ApplyOptions::default()).unwrap();

        assert_eq!(
            fs::read_to_string(tmp.path().join("code.rs")).unwrap(),
            "fn a() {}\nfn b() { panic!() }\n"
        );
    }

    #[test]
    fn test_ambiguous_region_rolls_back() {
        let (tmp, snap) = setup(&[("dup.txt", "same\nsame\n"), ("other.txt", "o\n")]);
        let raw = "REPLACE: other.txt\n```\nchanged\n```\n\nREPLACE_REGION: dup.txt\nMATCH:\n```\nsame\n```\nWITH:\n```\ndiff\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        let err = apply_plan(&plan, ApplyOptions::default()).unwrap_err();

        assert!(matches!(err, EngineError::RolledBack { .. }));
        // The earlier replace must have been undone
        assert_eq!(fs::read_to_string(tmp.path().join("other.txt")).unwrap(), "o\n");
        assert_eq!(fs::read_to_string(tmp.path().join("dup.txt")).unwrap(), "same\nsame\n");
    }

    #[test]
    fn test_ambiguous_region_first_match_opt_in() {
        let (tmp, snap) = setup(&[("dup.txt", "same\nsame\n")]);
        let raw = "REPLACE_REGION: dup.txt\nMATCH:\n```\nsame\n```\nWITH:\n```\ndiff\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        apply_plan(
            &plan,
            ApplyOptions {
                allow_first_match: true,
            },
        )
        .unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("dup.txt")).unwrap(), "diff\nsame\n");
    }

    #[test]
    fn test_external_change_aborts_with_no_writes() {
        let (tmp, snap) = setup(&[("a.txt", "original\n"), ("b.txt", "b\n")]);
        // Someone edits a.txt after the snapshot was taken
        fs::write(tmp.path().join("a.txt"), "externally changed\n").unwrap();

        let raw = "REPLACE: a.txt\n```\nfrom model\n```\n\nREPLACE: b.txt\n```\nnew b\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        let err = apply_plan(&plan, ApplyOptions::default()).unwrap_err();

        match err {
            EngineError::ConflictDetected { paths } => {
                assert_eq!(paths, vec![PathBuf::from("a.txt")]);
            }
            other => panic!("expected ConflictDetected, got {other}"),
        }
        // Whole plan aborted: b.txt untouched too
        assert_eq!(fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "externally changed\n");
        assert_eq!(fs::read_to_string(tmp.path().join("b.txt")).unwrap(), "b\n");
    }

    #[test]
    fn test_whitespace_only_drift_is_not_a_conflict() {
        let (tmp, snap) = setup(&[("a.txt", "line one\nline two\n")]);
        // Trailing whitespace appears after the snapshot
        fs::write(tmp.path().join("a.txt"), "line one  \nline two\t\n").unwrap();

        let raw = "REPLACE: a.txt\n```\nrewritten\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        apply_plan(&plan, ApplyOptions::default()).unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "rewritten");
    }

    #[test]
    fn test_idempotent_create_is_skipped() {
        let (tmp, snap) = setup(&[]);
        fs::write(tmp.path().join("already.txt"), "same content\n").unwrap();

        // Snapshot predates the file, so it is not fingerprinted; identical
        // content makes the create a no-op rather than a conflict.
        let raw = "CREATE: already.txt\n```\nsame content\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        let report = apply_plan(&plan, ApplyOptions::default()).unwrap();

        assert_eq!(report.applied(), 0);
        assert_eq!(report.skipped(), 1);
        let _ = tmp;
    }

    #[test]
    fn test_create_over_different_existing_file_conflicts() {
        let (_tmp, snap) = setup(&[]);
        fs::write(_tmp.path().join("already.txt"), "one thing\n").unwrap();

        let raw = "CREATE: already.txt\n```\nanother thing\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        let err = apply_plan(&plan, ApplyOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::ConflictDetected { .. }));
    }

    #[test]
    fn test_rename_moves_content() {
        let (tmp, snap) = setup(&[("old_name.rs", "content\n")]);
        let raw = "RENAME: old_name.rs -> nested/new_name.rs\n";
        let plan = parse_plan(raw, &snap).unwrap();
        apply_plan(&plan, ApplyOptions::default()).unwrap();

        assert!(!tmp.path().join("old_name.rs").exists());
        assert_eq!(
            fs::read_to_string(tmp.path().join("nested/new_name.rs")).unwrap(),
            "content\n"
        );
    }

    #[test]
    fn test_delete_then_create_reuses_path() {
        let (tmp, snap) = setup(&[("a.txt", "old\n")]);
        let raw = "DELETE: a.txt\n\nCREATE: a.txt\n```\nreborn\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        let report = apply_plan(&plan, ApplyOptions::default()).unwrap();

        assert_eq!(report.applied(), 2);
        assert_eq!(fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "reborn");
    }

    #[test]
    fn test_rollback_removes_created_directories() {
        let (tmp, snap) = setup(&[("target.txt", "t\n")]);
        // The create succeeds and builds brand/new/, then the region edit
        // fails; rollback must remove the created directory chain too.
        let raw = "CREATE: brand/new/file.txt\n```\nhello\n```\n\nREPLACE_REGION: target.txt\nMATCH:\n```\nnot present\n```\nWITH:\n```\nx\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        let err = apply_plan(&plan, ApplyOptions::default()).unwrap_err();

        assert!(matches!(err, EngineError::RolledBack { .. }));
        assert!(!tmp.path().join("brand/new/file.txt").exists());
        assert!(!tmp.path().join("brand").exists());
    }

    #[test]
    fn test_preexisting_directories_survive_rollback() {
        let (tmp, snap) = setup(&[("sub/keep.txt", "k\n"), ("target.txt", "t\n")]);
        let raw = "CREATE: sub/extra.txt\n```\ne\n```\n\nREPLACE_REGION: target.txt\nMATCH:\n```\nnot present\n```\nWITH:\n```\nx\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        let err = apply_plan(&plan, ApplyOptions::default()).unwrap_err();

        assert!(matches!(err, EngineError::RolledBack { .. }));
        assert!(!tmp.path().join("sub/extra.txt").exists());
        assert_eq!(fs::read_to_string(tmp.path().join("sub/keep.txt")).unwrap(), "k\n");
    }

    #[test]
    fn test_region_edit_matches_crlf_content() {
        let (tmp, snap) = setup(&[("code.rs", "fn a() {\r\n    1\r\n}\r\nfn b() {}\r\n")]);
        // Parsed match text is LF-only; the file on disk is CRLF, so a
        // multi-line match can never hit byte-for-byte.
        let raw = "REPLACE_REGION: code.rs\nMATCH:\n```\nfn a() {\n    1\n}\n```\nWITH:\n```\nfn a() {\n    2\n}\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        let report = apply_plan(&plan, ApplyOptions::default()).unwrap();

        assert_eq!(report.applied(), 1);
        assert_eq!(
            fs::read_to_string(tmp.path().join("code.rs")).unwrap(),
            "fn a() {\n    2\n}\nfn b() {}\n"
        );
    }

    #[test]
    fn test_rollback_restores_deleted_file() {
        let (tmp, snap) = setup(&[("keep.txt", "keep me\n"), ("target.txt", "t\n")]);
        // Delete succeeds, then the region edit fails (no match), forcing a
        // rollback that must resurrect keep.txt.
        let raw = "DELETE: keep.txt\n\nREPLACE_REGION: target.txt\nMATCH:\n```\nnot present\n```\nWITH:\n```\nx\n```\n";
        let plan = parse_plan(raw, &snap).unwrap();
        let err = apply_plan(&plan, ApplyOptions::default()).unwrap_err();

        assert!(matches!(err, EngineError::RolledBack { .. }));
        assert_eq!(fs::read_to_string(tmp.path().join("keep.txt")).unwrap(), "keep me\n");
        assert_eq!(fs::read_to_string(tmp.path().join("target.txt")).unwrap(), "t\n");
    }
}
