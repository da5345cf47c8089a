//! File I/O primitives: smart reads (mmap for large files) and the atomic
//! temp-file-then-rename write used for every mutation the applier makes.

use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::{self, File};
use std::path::Path;

const MMAP_THRESHOLD: u64 = 1024 * 1024; // 1 MiB

pub enum FileContent {
    Mapped(Mmap),
    Buffered(String),
}

impl AsRef<str> for FileContent {
    fn as_ref(&self) -> &str {
        match self {
            // Non-UTF-8 content degrades to empty; callers treat such files
            // as unreadable rather than panicking mid-session.
            FileContent::Mapped(mmap) => std::str::from_utf8(mmap).unwrap_or(""),
            FileContent::Buffered(s) => s.as_str(),
        }
    }
}

pub fn read_file_smart<P: AsRef<Path>>(path: P) -> Result<FileContent> {
    let path = path.as_ref();
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read metadata for {}", path.display()))?;

    if metadata.len() > MMAP_THRESHOLD {
        let file =
            File::open(path).with_context(|| format!("Failed to open file {}", path.display()))?;

        // Safety: read-only map of an existing regular file
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to memory-map {}", path.display()))?;

        Ok(FileContent::Mapped(mmap))
    } else {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read file {}", path.display()))?;

        Ok(FileContent::Buffered(content))
    }
}

/// Atomic write with robust temp file strategy.
/// The temp file lives in the destination directory so the final rename never
/// crosses filesystems; a crash mid-write leaves the original untouched.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    // Preserve original permissions where the file already exists
    #[cfg(unix)]
    let perms = fs::metadata(path)
        .map(|m| m.permissions())
        .unwrap_or_else(|_| std::os::unix::fs::PermissionsExt::from_mode(0o644));
    #[cfg(not(unix))]
    let perms = fs::metadata(path).map(|m| m.permissions()).ok();

    let tmp = match tempfile::NamedTempFile::new_in(dir) {
        Ok(t) => t,
        Err(_) => tempfile::NamedTempFile::new()?, // fallback to OS temp
    };

    use std::io::Write;
    let mut file = tmp.as_file();
    file.set_len(0)?;
    file.write_all(data)?;
    file.sync_all()?;

    #[cfg(unix)]
    fs::set_permissions(tmp.path(), perms).context("set temp permissions")?;
    #[cfg(not(unix))]
    if let Some(perms) = perms {
        fs::set_permissions(tmp.path(), perms).context("set temp permissions")?;
    }

    // fsync parent dir to ensure durability on Unix
    #[cfg(unix)]
    {
        if let Ok(parent_file) = File::open(dir) {
            let _ = parent_file.sync_all();
        }
    }

    match tmp.persist(path) {
        Ok(_) => {}
        Err(e) => {
            // Different filesystem? Try copy fallback
            fs::copy(e.file.path(), path)?;
        }
    }

    Ok(())
}
