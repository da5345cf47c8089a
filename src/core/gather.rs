//! Read-only context rendering for the inspection commands: directory trees,
//! concatenated file contents, and a quick signature scan.
//!
//! These share the walker and snapshot machinery with edit sessions so what
//! the user inspects is exactly what a session would send to the model.

use std::io::Cursor;
use std::path::PathBuf;

use anyhow::{Context, Result};
use ptree::TreeBuilder;
use regex::Regex;

use crate::core::snapshot::{display_path, fence_for, ProjectSnapshot};
use crate::infra::config::Config;

/// Render the scanned files as an indented tree, one tree per root.
pub fn tree_text(dirs: &[PathBuf], config: &Config) -> Result<String> {
    let snapshot = ProjectSnapshot::build(dirs, config).map_err(anyhow::Error::new)?;

    let mut builder = TreeBuilder::new(".".to_string());
    let mut open: Vec<String> = Vec::new();

    for entry in snapshot.entries.values() {
        let parts: Vec<String> = entry
            .rel_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        let dirs_of = &parts[..parts.len() - 1];

        // Pop back to the common ancestor, then descend
        let mut common = 0;
        while common < open.len() && common < dirs_of.len() && open[common] == dirs_of[common] {
            common += 1;
        }
        for _ in common..open.len() {
            builder.end_child();
            open.pop();
        }
        for dir in &dirs_of[common..] {
            builder.begin_child(dir.clone());
            open.push(dir.clone());
        }
        builder.add_empty_child(parts[parts.len() - 1].clone());
    }
    for _ in 0..open.len() {
        builder.end_child();
    }

    let tree = builder.build();
    let mut buf = Cursor::new(Vec::new());
    ptree::write_tree(&tree, &mut buf).context("Failed to render tree")?;
    String::from_utf8(buf.into_inner()).context("Tree output was not UTF-8")
}

/// Concatenate every readable file under the given roots, fenced and headed
/// the same way the model prompt is.
pub fn contents_text(dirs: &[PathBuf], config: &Config) -> Result<String> {
    let snapshot = ProjectSnapshot::build(dirs, config).map_err(anyhow::Error::new)?;

    let mut out = String::new();
    for entry in snapshot.entries.values() {
        let Some(content) = &entry.content else {
            continue;
        };
        let fence = fence_for(content);
        out.push_str(&format!(
            "=== {} ===\n{fence}\n{content}\n{fence}\n\n",
            display_path(&entry.rel_path)
        ));
    }
    Ok(out)
}

/// Line-oriented signature scan: function, type, and trait declarations for
/// the common languages. Coarse on purpose; this is orientation output, not
/// a parser.
pub fn signatures_text(dirs: &[PathBuf], config: &Config) -> Result<String> {
    let snapshot = ProjectSnapshot::build(dirs, config).map_err(anyhow::Error::new)?;

    let pattern = Regex::new(
        r"^\s*(pub\s+)?(async\s+)?(fn|struct|enum|trait|impl|class|interface|type|def|function|export\s+(default\s+)?(async\s+)?(function|class|interface|type|const))\b",
    )
    .context("signature pattern")?;

    let mut out = String::new();
    for entry in snapshot.entries.values() {
        let Some(content) = &entry.content else {
            continue;
        };
        let ext = entry
            .rel_path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        if !matches!(ext.as_str(), "rs" | "ts" | "tsx" | "js" | "jsx" | "py") {
            continue;
        }

        let mut hits: Vec<(usize, &str)> = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if pattern.is_match(line) {
                hits.push((n + 1, line.trim_end()));
            }
        }
        if hits.is_empty() {
            continue;
        }

        out.push_str(&format!("{}:\n", display_path(&entry.rel_path)));
        for (n, line) in hits {
            out.push_str(&format!("  {n:>4}  {line}\n"));
        }
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(
            tmp.path().join("src/lib.rs"),
            "pub fn visible() {}\n\nstruct Hidden;\n",
        )
        .unwrap();
        fs::write(tmp.path().join("notes.txt"), "plain text\n").unwrap();
        tmp
    }

    #[test]
    fn test_tree_text_nests_directories() {
        let tmp = fixture();
        let text = tree_text(&[tmp.path().to_path_buf()], &Config::default()).unwrap();
        assert!(text.contains("src"));
        assert!(text.contains("lib.rs"));
        assert!(text.contains("notes.txt"));
    }

    #[test]
    fn test_contents_text_is_fenced() {
        let tmp = fixture();
        let text = contents_text(&[tmp.path().to_path_buf()], &Config::default()).unwrap();
        assert!(text.contains("=== src/lib.rs ==="));
        assert!(text.contains("pub fn visible()"));
        assert!(text.contains("plain text"));
    }

    #[test]
    fn test_signatures_skip_non_source_files() {
        let tmp = fixture();
        let text = signatures_text(&[tmp.path().to_path_buf()], &Config::default()).unwrap();
        assert!(text.contains("src/lib.rs:"));
        assert!(text.contains("pub fn visible() {}"));
        assert!(text.contains("struct Hidden;"));
        assert!(!text.contains("notes.txt"));
    }
}
