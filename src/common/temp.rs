//! Utilities for managing temporary work directories.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Prepare a work directory, removing it if it exists and creating it fresh.
///
/// # Arguments
/// * `parent_dir` - Parent directory where the work dir should be created
/// * `name` - Name of the work directory (e.g., ".staging-alpine-k3s")
pub fn prepare_work_dir(parent_dir: &Path, name: &str) -> io::Result<PathBuf> {
    let work_dir = parent_dir.join(name);

    // Clean up if it exists from a previous run
    if work_dir.exists() {
        fs::remove_dir_all(&work_dir)?;
    }

    fs::create_dir_all(&work_dir)?;

    Ok(work_dir)
}

/// Clean up a work directory after use.
///
/// Idempotent: a missing directory is ignored.
pub fn cleanup_work_dir(path: &Path) {
    let _ = fs::remove_dir_all(path);
}
