//! Host environment probing.
//!
//! Everything preflight and context detection learn about the host goes
//! through [`EnvironmentProbe`] so tests can describe a host instead of
//! needing one.

use std::fs;
use std::path::Path;

use crate::exec::PROC_MOUNTS;
use crate::process::{self, Cmd};

pub trait EnvironmentProbe: Send + Sync {
    /// Effective UID 0.
    fn is_privileged(&self) -> bool;

    /// `program` resolves on PATH.
    fn has_tool(&self, program: &str) -> bool;

    /// Free space in MB on the filesystem holding `path` (or its nearest
    /// existing ancestor). `None` when it cannot be determined.
    fn free_disk_mb(&self, path: &Path) -> Option<u64>;

    /// Contents of `/proc/filesystems`.
    fn kernel_filesystems(&self) -> Option<String>;

    /// A cgroup hierarchy is mounted.
    fn cgroups_mounted(&self) -> bool;

    /// Contents of `/proc/self/mounts`.
    fn active_mounts(&self) -> Option<String>;
}

/// Probe of the real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

/// Nearest ancestor of `path` that exists.
fn existing_ancestor(path: &Path) -> &Path {
    let mut current = path;
    while !current.exists() {
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return Path::new("."),
        }
    }
    current
}

/// Parse `df --output=avail -B1` output into MB.
pub fn parse_df_avail(stdout: &str) -> Option<u64> {
    let bytes: u64 = stdout.lines().nth(1)?.trim().parse().ok()?;
    Some(bytes / (1024 * 1024))
}

impl EnvironmentProbe for SystemProbe {
    fn is_privileged(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    fn has_tool(&self, program: &str) -> bool {
        process::exists(program)
    }

    fn free_disk_mb(&self, path: &Path) -> Option<u64> {
        let result = Cmd::new("df")
            .args(["--output=avail", "-B1"])
            .arg_path(existing_ancestor(path))
            .allow_fail()
            .run()
            .ok()?;
        if !result.success() {
            return None;
        }
        parse_df_avail(&result.stdout)
    }

    fn kernel_filesystems(&self) -> Option<String> {
        fs::read_to_string("/proc/filesystems").ok()
    }

    fn cgroups_mounted(&self) -> bool {
        Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
            || Path::new("/sys/fs/cgroup/memory").is_dir()
    }

    fn active_mounts(&self) -> Option<String> {
        fs::read_to_string(PROC_MOUNTS).ok()
    }
}
