//! Exclusive ownership of a build root and cleanup on every exit path.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::EnvironmentError;
use crate::exec::{CommandRunner, MountTable};

#[derive(Debug, Serialize, Deserialize)]
struct LockMetadata {
    pid: u32,
    started_at: String,
    build_root: PathBuf,
}

/// Advisory `flock` on `<build_root>.lock`.
#[derive(Debug)]
pub struct BuildRootLock {
    file: File,
    path: PathBuf,
}

/// `<build_root>.lock`
pub fn lock_path(build_root: &Path) -> PathBuf {
    let mut name = build_root.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn try_flock(file: &File) -> io::Result<()> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

impl BuildRootLock {
    /// Take the lock or fail immediately if another run holds it.
    pub fn acquire(build_root: &Path) -> Result<Self, EnvironmentError> {
        let path = lock_path(build_root);
        let locked = |holder: Option<u32>| EnvironmentError::BuildRootLocked {
            path: build_root.to_path_buf(),
            holder,
        };
        let capability = |e: io::Error| EnvironmentError::MissingCapability {
            capability: format!("lock file {}", path.display()),
            hint: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(capability)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(capability)?;

        if let Err(e) = try_flock(&file) {
            if e.kind() == io::ErrorKind::WouldBlock {
                return Err(locked(read_holder(&path)));
            }
            return Err(capability(e));
        }

        let metadata = LockMetadata {
            pid: std::process::id(),
            started_at: chrono::Utc::now().to_rfc3339(),
            build_root: build_root.to_path_buf(),
        };
        let write = || -> io::Result<()> {
            file.set_len(0)?;
            let mut writer = io::BufWriter::new(&file);
            serde_json::to_writer_pretty(&mut writer, &metadata).map_err(io::Error::other)?;
            writer.flush()
        };
        write().map_err(capability)?;

        debug!("locked {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    let mut text = String::new();
    File::open(path).ok()?.read_to_string(&mut text).ok()?;
    serde_json::from_str::<LockMetadata>(&text).ok().map(|m| m.pid)
}

impl Drop for BuildRootLock {
    fn drop(&mut self) {
        // Remove first so a waiting run never sees our stale metadata.
        let _ = fs::remove_file(&self.path);
        // SAFETY: see try_flock.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// What a cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub unmounted: usize,
    /// Mounts that survived; the root is not removed while any remain.
    pub still_mounted: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub lock_released: bool,
}

/// Scoped owner of a build root.
///
/// `cleanup()` is idempotent and also runs on drop, so unmounting, scratch
/// removal and lock release happen on success, failure, panic unwind and
/// cancellation alike.
pub struct BuildRootGuard {
    root: PathBuf,
    lock: Option<BuildRootLock>,
    mounts: Option<(Arc<Mutex<MountTable>>, Arc<dyn CommandRunner>)>,
    scratch: Vec<PathBuf>,
    remove_root: bool,
    cleaned: bool,
}

impl BuildRootGuard {
    /// Lock `root` for this run.
    pub fn acquire(root: &Path) -> Result<Self, EnvironmentError> {
        let lock = BuildRootLock::acquire(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            lock: Some(lock),
            mounts: None,
            scratch: Vec::new(),
            remove_root: false,
            cleaned: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }

    /// Unmount the table's mounts during cleanup.
    pub fn track_mounts(&mut self, table: Arc<Mutex<MountTable>>, runner: Arc<dyn CommandRunner>) {
        self.mounts = Some((table, runner));
    }

    /// Remove `path` during cleanup.
    pub fn add_scratch(&mut self, path: PathBuf) {
        if !self.scratch.contains(&path) {
            self.scratch.push(path);
        }
    }

    /// Also delete the build root itself during cleanup.
    pub fn remove_root_on_cleanup(&mut self, remove: bool) {
        self.remove_root = remove;
    }

    /// Unmount, delete scratch paths, release the lock. Later calls do nothing.
    pub fn cleanup(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.cleaned {
            return report;
        }
        self.cleaned = true;

        if let Some((table, runner)) = self.mounts.take() {
            let mut table = table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let unmounted = table.unmount_all(runner.as_ref(), &self.root);
            report.unmounted = unmounted.unmounted;
            report.still_mounted = unmounted.busy;
        }

        let mut doomed = std::mem::take(&mut self.scratch);
        if self.remove_root && report.still_mounted.is_empty() {
            doomed.push(self.root.clone());
        } else if self.remove_root {
            warn!(
                "keeping {}: still mounted at {:?}",
                self.root.display(),
                report.still_mounted
            );
        }
        for path in doomed {
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => report.removed.push(path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove {}: {}", path.display(), e),
            }
        }

        if let Some(lock) = self.lock.take() {
            drop(lock);
            report.lock_released = true;
        }

        if report.unmounted > 0 || !report.removed.is_empty() {
            info!(
                "cleaned up {} ({} unmounted, {} removed)",
                self.root.display(),
                report.unmounted,
                report.removed.len()
            );
        }
        report
    }
}

impl Drop for BuildRootGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}
