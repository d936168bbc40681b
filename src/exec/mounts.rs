//! Pseudo-filesystem mounts inside the build root.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::runner::CommandRunner;
use crate::process::Cmd;

/// What gets mounted into an isolated root, in mount order.
pub const PSEUDO_MOUNTS: &[(&str, &str)] = &[("proc", "proc"), ("sysfs", "sys"), ("dev", "dev")];

/// Mount points created under a root, in the order they were mounted.
#[derive(Debug, Default)]
pub struct MountTable {
    mounts: Vec<PathBuf>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.mounts
    }

    /// Mount `fstype` at `<root>/<rel>`. `dev` is bind-mounted from the host.
    pub fn mount(&mut self, runner: &dyn CommandRunner, root: &Path, fstype: &str, rel: &str) -> Result<(), String> {
        let target = root.join(rel);
        fs::create_dir_all(&target).map_err(|e| format!("{}: {}", target.display(), e))?;

        let cmd = if fstype == "dev" {
            Cmd::new("mount").args(["--bind", "/dev"]).arg_path(&target)
        } else {
            Cmd::new("mount").args(["-t", fstype, fstype]).arg_path(&target)
        };
        let line = cmd.display();
        runner.run(cmd).map_err(|e| format!("{line}: {e}"))?;
        debug!("mounted {}", target.display());
        self.mounts.push(target);
        Ok(())
    }

    /// Unmount every tracked mount in reverse order, then anything else the
    /// kernel still reports under `root`.
    ///
    /// Safe to call repeatedly; with nothing mounted it does nothing.
    pub fn unmount_all(&mut self, runner: &dyn CommandRunner, root: &Path) -> UnmountReport {
        let mut targets: Vec<PathBuf> = self.mounts.drain(..).rev().collect();
        if let Ok(text) = fs::read_to_string(PROC_MOUNTS) {
            for extra in mounts_under(&text, root) {
                if !targets.contains(&extra) {
                    targets.push(extra);
                }
            }
        }
        unmount_each(runner, targets)
    }
}

/// Where the kernel lists live mounts.
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// What an unmount pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmountReport {
    pub unmounted: usize,
    /// Mount points that stayed mounted.
    pub busy: Vec<PathBuf>,
}

impl UnmountReport {
    pub fn is_clean(&self) -> bool {
        self.busy.is_empty()
    }
}

/// Unmount whatever `mounts` (a `/proc/self/mounts` listing) shows at or
/// below `root`, deepest first.
pub fn unmount_under(runner: &dyn CommandRunner, mounts: &str, root: &Path) -> UnmountReport {
    unmount_each(runner, mounts_under(mounts, root))
}

fn unmount_each(runner: &dyn CommandRunner, targets: Vec<PathBuf>) -> UnmountReport {
    let mut report = UnmountReport::default();
    for target in targets {
        if unmount(runner, &target) {
            report.unmounted += 1;
        } else {
            report.busy.push(target);
        }
    }
    report
}

fn unmount(runner: &dyn CommandRunner, target: &Path) -> bool {
    if runner.run(Cmd::new("umount").arg_path(target)).is_ok() {
        debug!("unmounted {}", target.display());
        return true;
    }
    // Busy (a leftover process in the root): detach lazily.
    match runner.run(Cmd::new("umount").arg("-l").arg_path(target)) {
        Ok(_) => true,
        Err(e) => {
            warn!("could not unmount {}: {}", target.display(), e);
            false
        }
    }
}

/// Decode the octal escapes `/proc/self/mounts` uses for spaces and tabs.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes.get(i + 1..i + 4).filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)));
        match (bytes[i], octal) {
            (b'\\', Some(d)) => {
                let code = u32::from(d[0] - b'0') * 64 + u32::from(d[1] - b'0') * 8 + u32::from(d[2] - b'0');
                out.push(code as u8);
                i += 4;
            }
            (b, _) => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points at or below `root`, deepest first.
pub fn mounts_under(mounts: &str, root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape(field)))
        .filter(|path| path.starts_with(root))
        .collect();
    found.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    found.dedup();
    found
}
