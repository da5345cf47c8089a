//! Context Builder: a bounded, read-only snapshot of the target directories.
//!
//! The snapshot is built once per edit session, serialized into the model
//! prompt, and its fingerprints travel with the edit plan for conflict
//! detection at apply time. It is never refreshed mid-session.

use std::fs;
use std::path::{Component, Path, PathBuf};

use indexmap::IndexMap;
use tracing::debug;

use crate::core::errors::EngineError;
use crate::infra::config::Config;
use crate::infra::walk::FileWalker;

/// Content fingerprint (xxh64 over normalized text).
pub type Fingerprint = u64;

/// Shared normalizer for fingerprint and region comparisons: strips trailing
/// spaces/tabs/CR per line so whitespace-only churn never reads as a conflict.
pub fn normalize_text(s: &str) -> String {
    s.lines()
        .map(|l| l.trim_end_matches([' ', '\t', '\r']))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deterministic content fingerprint using xxh64 with fixed seed.
pub fn fingerprint(content: &str) -> Fingerprint {
    xxhash_rust::xxh64::xxh64(normalize_text(content).as_bytes(), 0)
}

/// One file captured by the snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    /// Path as presented to the model (relative, '/'-separated)
    pub rel_path: PathBuf,
    /// Full text; None for binary files or entries demoted to tree-only
    /// by the size ceiling
    pub content: Option<String>,
    pub size_bytes: u64,
    pub fingerprint: Fingerprint,
}

/// The scanned roots, with the label scheme used in model-facing paths.
/// A single root maps plain relative paths; multiple roots prefix each path
/// with the root's directory name so one plan can address all of them.
#[derive(Debug, Clone)]
pub struct Roots {
    labeled: Vec<(String, PathBuf)>,
}

impl Roots {
    fn new(roots: Vec<(String, PathBuf)>) -> Self {
        Self { labeled: roots }
    }

    pub fn is_multi(&self) -> bool {
        self.labeled.len() > 1
    }

    /// Map a model-facing relative path to an absolute filesystem path.
    /// Rejects anything that would land outside the scanned roots.
    pub fn resolve(&self, rel: &Path) -> Result<PathBuf, String> {
        if !is_normalized_relative(rel) {
            return Err(format!("path escapes scanned root: {}", rel.display()));
        }
        if self.labeled.len() == 1 {
            return Ok(self.labeled[0].1.join(rel));
        }
        let mut components = rel.components();
        let first = components
            .next()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .unwrap_or_default();
        let remainder: PathBuf = components.collect();
        for (label, base) in &self.labeled {
            if *label == first {
                if remainder.as_os_str().is_empty() {
                    return Err(format!("path names a root, not a file: {}", rel.display()));
                }
                return Ok(base.join(remainder));
            }
        }
        Err(format!(
            "path {} is not under any scanned root ({})",
            rel.display(),
            self.labeled
                .iter()
                .map(|(l, _)| l.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

/// A relative path is acceptable when it has no parent/rootish components.
pub fn is_normalized_relative(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Immutable per-session view of the project.
#[derive(Debug)]
pub struct ProjectSnapshot {
    pub roots: Roots,
    pub entries: IndexMap<PathBuf, SnapshotEntry>,
}

impl ProjectSnapshot {
    /// Scan every given root and capture file contents, demoting the largest
    /// files to tree-only entries once the configured ceiling is exceeded.
    pub fn build(roots: &[PathBuf], config: &Config) -> Result<Self, EngineError> {
        let mut labeled = Vec::with_capacity(roots.len());
        for root in roots {
            let meta = fs::metadata(root).map_err(|e| EngineError::InvalidRoot {
                path: root.clone(),
                reason: e.to_string(),
            })?;
            if !meta.is_dir() {
                return Err(EngineError::InvalidRoot {
                    path: root.clone(),
                    reason: "not a directory".into(),
                });
            }
            let abs = dunce::canonicalize(root).unwrap_or_else(|_| root.clone());
            let base = abs
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| abs.display().to_string());
            // Roots sharing a basename get numbered labels so their entries
            // never collide and resolve stays unambiguous
            let mut label = base.clone();
            let mut n = 2;
            while labeled.iter().any(|(l, _): &(String, PathBuf)| *l == label) {
                label = format!("{base}-{n}");
                n += 1;
            }
            labeled.push((label, abs));
        }
        let multi = labeled.len() > 1;

        let walker = FileWalker::new(&config.ignore_patterns).map_err(EngineError::Internal)?;

        let mut entries: IndexMap<PathBuf, SnapshotEntry> = IndexMap::new();
        for (label, base) in &labeled {
            for abs in walker.walk_files(base) {
                let rel = match abs.strip_prefix(base) {
                    Ok(r) => r.to_path_buf(),
                    Err(_) => continue,
                };
                let rel_path = if multi {
                    Path::new(label).join(&rel)
                } else {
                    rel
                };
                let bytes = match fs::read(&abs) {
                    Ok(b) => b,
                    Err(e) => {
                        debug!(path = %abs.display(), error = %e, "skipping unreadable file");
                        continue;
                    }
                };
                let size_bytes = bytes.len() as u64;
                let (content, fp) = match String::from_utf8(bytes) {
                    Ok(text) => {
                        let fp = fingerprint(&text);
                        (Some(text), fp)
                    }
                    // Binary files appear in the tree but carry no content
                    Err(e) => (None, xxhash_rust::xxh64::xxh64(e.as_bytes(), 0)),
                };
                entries.insert(
                    rel_path.clone(),
                    SnapshotEntry {
                        rel_path,
                        content,
                        size_bytes,
                        fingerprint: fp,
                    },
                );
            }
        }

        let mut snapshot = Self {
            roots: Roots::new(labeled),
            entries,
        };
        snapshot.enforce_ceiling(config.context.max_bytes);
        Ok(snapshot)
    }

    /// Demote the largest content-bearing entries to tree-only until the
    /// total content size fits under `max_bytes`. Small source files are the
    /// last to lose their content.
    fn enforce_ceiling(&mut self, max_bytes: usize) {
        let mut total: u64 = self
            .entries
            .values()
            .filter(|e| e.content.is_some())
            .map(|e| e.size_bytes)
            .sum();

        while total > max_bytes as u64 {
            let largest = self
                .entries
                .values()
                .filter(|e| e.content.is_some())
                .max_by_key(|e| e.size_bytes)
                .map(|e| e.rel_path.clone());
            let Some(path) = largest else { break };
            if let Some(entry) = self.entries.get_mut(&path) {
                debug!(path = %path.display(), size = entry.size_bytes, "demoting to tree-only");
                entry.content = None;
                total -= entry.size_bytes;
            }
        }
    }

    /// Fingerprints keyed by model-facing path, handed to the plan parser.
    pub fn fingerprints(&self) -> IndexMap<PathBuf, Fingerprint> {
        self.entries
            .iter()
            .map(|(p, e)| (p.clone(), e.fingerprint))
            .collect()
    }

    /// Render the snapshot as prompt context: a flat tree section, then a
    /// fenced content section per file that still carries content.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str("## Project files\n\n");
        for entry in self.entries.values() {
            out.push_str(&display_path(&entry.rel_path));
            if entry.content.is_none() {
                out.push_str(" (content omitted)");
            }
            out.push('\n');
        }
        out.push('\n');
        for entry in self.entries.values() {
            let Some(content) = &entry.content else {
                continue;
            };
            let fence = fence_for(content);
            out.push_str(&format!(
                "=== {} ===\n{fence}\n{content}\n{fence}\n\n",
                display_path(&entry.rel_path)
            ));
        }
        out
    }
}

/// Model-facing rendering of a relative path ('/' even on Windows).
pub fn display_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Pick a backtick fence longer than any run inside the content.
pub fn fence_for(content: &str) -> String {
    let mut longest = 0usize;
    let mut current = 0usize;
    for ch in content.chars() {
        if ch == '`' {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    "`".repeat((longest + 1).max(3))
}
