//! Final checks on the built tree.

use std::path::Path;

use super::runtime::{RUNTIME_BINARY, RUNTIME_CONFIG};
use super::{BuildState, Stage};
use crate::error::StageError;

/// Directories every unpacked base image must have.
pub const SKELETON_DIRS: &[&str] = &["bin", "etc", "lib", "sbin", "usr", "var"];

/// Root-relative paths a usable template must contain.
pub fn critical_paths(service: &str) -> Vec<String> {
    vec![
        "bin/sh".to_string(),
        "etc/os-release".to_string(),
        RUNTIME_BINARY.to_string(),
        format!("etc/init.d/{service}"),
        RUNTIME_CONFIG.to_string(),
    ]
}

/// Entries of `paths` missing under `root`. Symlinks count as present even
/// when their absolute target only resolves inside the root.
pub fn missing_paths(root: &Path, paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .filter(|rel| root.join(rel).symlink_metadata().is_err())
        .cloned()
        .collect()
}

/// `k3s version v1.28.4+k3s1 (6ba6c1b6)` -> `v1.28.4+k3s1`
pub fn parse_runtime_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("k3s"), Some("version"), Some(version)) => Some(version.to_string()),
            _ => None,
        }
    })
}

pub(super) fn verify_build(state: &mut BuildState<'_>) -> Result<(), StageError> {
    let config = state.config;
    let root = state.root().to_path_buf();

    println!("Verifying build...");
    let missing = missing_paths(&root, &critical_paths(&config.runtime.service_name));
    if !missing.is_empty() {
        return Err(StageError::MissingCriticalPaths { root, missing });
    }

    let exec = state.executor(Stage::VerifyBuild)?;
    let result = exec.run_in_root_or_host(&format!("/{RUNTIME_BINARY}"), &["--version"])?;
    let actual = parse_runtime_version(&result.stdout).unwrap_or_else(|| result.stdout_trimmed().to_string());
    if actual != config.runtime.version {
        return Err(StageError::RuntimeVersionMismatch {
            expected: config.runtime.version.clone(),
            actual,
        });
    }

    println!("  k3s reports {}", actual);
    state.installed_version = Some(actual);
    Ok(())
}
