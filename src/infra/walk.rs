//! Gitignore-aware file walker with extra ignore globs.
//! - Respects .gitignore, .git/info/exclude, and global gitignore
//! - Extra ignore globs (early prune + late filter)
//! - Deterministic ordering for stable prompts and tests
//!
//! Backed by ripgrep's `ignore` crate and `globset`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::{DirEntry, WalkBuilder};

/// Gitignore-aware walker with additional ignore patterns.
/// Extra globs are applied in two places:
///   1) Early: prune directories during traversal (filter_entry).
///   2) Late: filter out files that still slipped through.
pub struct FileWalker {
    /// Compiled set of additional ignore patterns
    ignore_patterns: GlobSet,

    /// Include hidden (dot) files; default false for prompt context
    include_hidden: bool,

    /// Maximum recursion depth; default None (unbounded)
    max_depth: Option<usize>,
}

impl FileWalker {
    /// Build a walker with additional ignore patterns (e.g., "target/**",
    /// "node_modules/**"). Patterns match on (relative) paths.
    pub fn new(additional_ignores: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in additional_ignores {
            builder.add(Glob::new(pattern)?);
            // Directory-style patterns ("target/") also prune their subtree
            if let Some(stripped) = pattern.strip_suffix('/') {
                builder.add(Glob::new(&format!("{stripped}/**"))?);
                builder.add(Glob::new(stripped)?);
            }
        }

        Ok(Self {
            ignore_patterns: builder.build()?,
            include_hidden: false,
            max_depth: None,
        })
    }

    /// Include or exclude hidden files (dotfiles).
    pub fn with_include_hidden(mut self, include_hidden: bool) -> Self {
        self.include_hidden = include_hidden;
        self
    }

    /// Limit recursion depth (`None` = unbounded).
    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    fn build_walk(&self, root: &Path) -> WalkBuilder {
        let mut b = WalkBuilder::new(root);

        // WalkBuilder::hidden(true) means *skip* dotfiles
        b.hidden(!self.include_hidden);

        // Respect .ignore/.gitignore/.git/info/exclude and global gitignore
        b.git_ignore(true);
        b.git_global(true);
        b.git_exclude(true);

        b.follow_links(false);
        b.max_depth(self.max_depth);

        // Early directory pruning using extra ignores
        let extra = self.ignore_patterns.clone();
        let root_owned = root.to_path_buf();
        b.filter_entry(move |ent: &DirEntry| {
            let is_dir = ent.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
            if is_dir {
                let rel = ent.path().strip_prefix(&root_owned).unwrap_or(ent.path());
                if extra.is_match(rel) {
                    return false;
                }
            }
            true
        });

        b
    }

    /// Traverse files under `root`, respecting ignore rules and extra globs.
    /// Returns a **sorted** list of file paths for determinism.
    pub fn walk_files<P: AsRef<Path>>(&self, root: P) -> Vec<PathBuf> {
        let root_path = root.as_ref();
        let walker = self.build_walk(root_path).build();

        let mut out: Vec<PathBuf> = walker
            .filter_map(|res| res.ok())
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .map(|entry| entry.into_path())
            // Late file-level filtering using the RELATIVE path
            .filter(|abs| {
                let rel = abs.strip_prefix(root_path).unwrap_or(abs);
                !self.ignore_patterns.is_match(rel)
            })
            .collect();

        out.sort();
        out
    }
}
