//! Walks a job's working directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Html,
    Css,
    Other,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("html" | "htm") => FileKind::Html,
            Some("css") => FileKind::Css,
            _ => FileKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    /// Path relative to the tree root
    pub relative: PathBuf,
    pub kind: FileKind,
}

/// Lists every regular file below `root`, sorted by relative path.
///
/// Leftover `.part` files from aborted writes are skipped.
pub fn list_files(root: &Path) -> io::Result<Vec<SavedFile>> {
    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

fn walk(root: &Path, dir: &Path, files: &mut Vec<SavedFile>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            walk(root, &path, files)?;
        } else if file_type.is_file() {
            if path.extension().is_some_and(|e| e == "part") {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(root) {
                files.push(SavedFile {
                    kind: FileKind::from_path(relative),
                    relative: relative.to_path_buf(),
                });
            }
        }
    }
    Ok(())
}
