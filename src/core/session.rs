//! Edit Session Controller: one instruction in, a committed (or cleanly
//! aborted) working tree out.
//!
//! The session owns the lifecycle: build the snapshot, prompt the model,
//! parse with a bounded corrective-retry loop, then hand the plan to the
//! applier. Model transport failures abort immediately; only grammar
//! violations are retried, with the parse error folded back into the prompt.

use std::path::PathBuf;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use similar::TextDiff;
use tracing::{debug, info, instrument};

use crate::cli::AppContext;
use crate::core::apply::{apply_plan, disk_fingerprint, ApplyOptions, OpOutcome};
use crate::core::errors::EngineError;
use crate::core::gateway::{build_prompt, build_retry_prompt, ModelClient};
use crate::core::plan::{parse_plan, EditOperation, EditPlan};
use crate::core::snapshot::{display_path, fingerprint, ProjectSnapshot};
use crate::infra::config::Config;

/// Session lifecycle, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    BuildingContext,
    AwaitingModel,
    Parsing,
    Applying,
    Committed,
    DryRun,
}

/// Machine-readable result of one edit session.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub dry_run: bool,
    pub created: usize,
    pub replaced: usize,
    pub edited: usize,
    pub deleted: usize,
    pub renamed: usize,
    pub skipped: usize,
    /// Human-readable plan preview; only populated for dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Drive a full edit session against the given roots.
#[instrument(skip_all, fields(roots = roots.len()))]
pub fn run_edit_session(
    roots: &[PathBuf],
    instruction: &str,
    client: &dyn ModelClient,
    config: &Config,
    ctx: &AppContext,
) -> Result<SessionSummary, EngineError> {
    transition(SessionState::BuildingContext);
    let snapshot = ProjectSnapshot::build(roots, config)?;
    let context = snapshot.serialize();
    info!(
        files = snapshot.entries.len(),
        context_bytes = context.len(),
        multi_root = snapshot.roots.is_multi(),
        "snapshot built"
    );

    let plan = request_plan(instruction, &context, &snapshot, client, config, ctx)?;

    if ctx.dry_run {
        transition(SessionState::DryRun);
        let preview = preview_plan(&plan, &snapshot);
        return Ok(summarize(&plan, None, Some(preview)));
    }

    transition(SessionState::Applying);
    let report = apply_plan(
        &plan,
        ApplyOptions {
            allow_first_match: config.apply.allow_first_match,
        },
    )?;
    transition(SessionState::Committed);
    Ok(summarize(&plan, Some(&report.ops), None))
}

/// Prompt the model and parse, retrying malformed responses with corrective
/// feedback up to the configured limit. Transport errors are never retried.
fn request_plan(
    instruction: &str,
    context: &str,
    snapshot: &ProjectSnapshot,
    client: &dyn ModelClient,
    config: &Config,
    ctx: &AppContext,
) -> Result<EditPlan, EngineError> {
    let mut prompt = build_prompt(instruction, context);
    let mut last_err = None;

    for attempt in 0..=config.session.parse_retries {
        transition(SessionState::AwaitingModel);
        let spinner = start_spinner(ctx, attempt);
        let response = client.invoke(&prompt);
        if let Some(s) = spinner {
            s.finish_and_clear();
        }
        let response = response?;

        transition(SessionState::Parsing);
        match parse_plan(&response, snapshot) {
            Ok(plan) => {
                info!(ops = plan.ops.len(), attempt, "plan parsed");
                return Ok(plan);
            }
            Err(e) => {
                debug!(attempt, error = %e, "malformed response");
                prompt = build_retry_prompt(instruction, context, &response, &e.to_string());
                last_err = Some(e);
            }
        }
    }

    // parse_retries attempts exhausted; last_err is always set here
    Err(EngineError::Malformed(last_err.ok_or_else(|| {
        EngineError::Internal(anyhow::anyhow!("retry loop ended without a parse error"))
    })?))
}

fn transition(state: SessionState) {
    debug!(?state, "session state");
}

fn start_spinner(ctx: &AppContext, attempt: u32) -> Option<ProgressBar> {
    if ctx.quiet {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(if attempt == 0 {
        "Waiting for model...".to_string()
    } else {
        format!("Retrying after malformed response (attempt {})...", attempt + 1)
    });
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

/// Per-operation preview with unified diffs where the old content is known.
fn preview_plan(plan: &EditPlan, snapshot: &ProjectSnapshot) -> String {
    let mut out = String::new();
    for op in &plan.ops {
        match op {
            EditOperation::CreateFile { path, content } => {
                out.push_str(&format!(
                    "create {} (+{} lines)\n",
                    display_path(path),
                    content.lines().count()
                ));
            }
            EditOperation::ReplaceFile { path, content } => {
                out.push_str(&format!("replace {}\n", display_path(path)));
                if let Some(old) = snapshot.entries.get(path).and_then(|e| e.content.as_deref()) {
                    out.push_str(&unified_diff(old, content, &display_path(path)));
                }
            }
            EditOperation::ReplaceRegion {
                path,
                match_text,
                new_text,
            } => {
                out.push_str(&format!("edit {}\n", display_path(path)));
                out.push_str(&unified_diff(match_text, new_text, &display_path(path)));
            }
            EditOperation::DeleteFile { path } => {
                out.push_str(&format!("delete {}\n", display_path(path)));
            }
            EditOperation::RenameFile { from, to } => {
                out.push_str(&format!(
                    "rename {} -> {}\n",
                    display_path(from),
                    display_path(to)
                ));
            }
        }
    }
    out
}

fn unified_diff(old: &str, new: &str, path: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(2)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

fn summarize(
    plan: &EditPlan,
    report: Option<&[crate::core::apply::OpReport]>,
    preview: Option<String>,
) -> SessionSummary {
    let mut summary = SessionSummary {
        dry_run: preview.is_some(),
        created: 0,
        replaced: 0,
        edited: 0,
        deleted: 0,
        renamed: 0,
        skipped: 0,
        preview,
    };

    match report {
        Some(ops) => {
            for r in ops {
                if r.outcome == OpOutcome::SkippedUnchanged {
                    summary.skipped += 1;
                    continue;
                }
                bump(&mut summary, r.kind);
            }
        }
        // Dry run: count off the plan, but report operations that would not
        // change anything as skipped, matching what a real apply reports.
        None => {
            for op in &plan.ops {
                if dry_run_unchanged(plan, op) {
                    summary.skipped += 1;
                } else {
                    bump(&mut summary, op.kind());
                }
            }
        }
    }
    summary
}

/// Would this operation be a no-op if applied right now? Mirrors the
/// applier's idempotence checks without touching the tree.
fn dry_run_unchanged(plan: &EditPlan, op: &EditOperation) -> bool {
    match op {
        EditOperation::CreateFile { path, content } => {
            let Ok(abs) = plan.roots.resolve(path) else {
                return false;
            };
            disk_fingerprint(&abs).is_some_and(|fp| fp == fingerprint(content))
        }
        EditOperation::ReplaceFile { path, content } => plan
            .fingerprints
            .get(path)
            .is_some_and(|fp| *fp == fingerprint(content)),
        _ => false,
    }
}

fn bump(summary: &mut SessionSummary, kind: &str) {
    match kind {
        "CREATE" => summary.created += 1,
        "REPLACE" => summary.replaced += 1,
        "REPLACE_REGION" => summary.edited += 1,
        "DELETE" => summary.deleted += 1,
        "RENAME" => summary.renamed += 1,
        _ => {}
    }
}
