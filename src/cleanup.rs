use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
}

/// Deletes decompressed `*.txt` files under `processed_dir`, then removes
/// directories that ended up empty, deepest first. `processed_dir` itself
/// is kept. Failures are skipped.
pub fn remove_intermediates(processed_dir: &Path) -> CleanupReport {
    let mut report = CleanupReport::default();
    let (files, mut dirs) = walk(processed_dir);

    for file in files {
        if file.extension().is_some_and(|ext| ext == "txt") {
            match fs::remove_file(&file) {
                Ok(()) => report.files_removed += 1,
                Err(err) => {
                    tracing::debug!(path = %file.display(), error = %err, "skip remove");
                }
            }
        }
    }

    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        let is_empty = fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty && fs::remove_dir(&dir).is_ok() {
            report.dirs_removed += 1;
        }
    }
    report
}

/// Files and directories below `root`, excluding `root`. Unreadable
/// directories are skipped.
fn walk(root: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let Ok(entries) = fs::read_dir(&path) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => {
                    stack.push(path.clone());
                    dirs.push(path);
                }
                Ok(_) => files.push(path),
                Err(_) => {}
            }
        }
    }
    (files, dirs)
}
