//! Shared helpers for the pipeline integration tests.

use camino::{Utf8Path, Utf8PathBuf};

/// Every file below `root`, relative to it.
pub fn files(root: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in dir.read_dir_utf8().unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                stack.push(entry.path().to_path_buf());
            } else {
                found.push(entry.path().strip_prefix(root).unwrap().to_path_buf());
            }
        }
    }

    found.sort();
    found
}
