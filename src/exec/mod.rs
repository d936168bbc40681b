//! Running operations against a root filesystem.
//!
//! The context is detected once per run and carried by [`Executor`]; no stage
//! decides for itself whether it is "inside" the target root.
//!
//! - [`ExecutionContext::Isolated`]: we are privileged and the root has a
//!   package manager, so in-root operations run as `chroot <root> ...`.
//! - [`ExecutionContext::Host`]: in-root operations are skipped until
//!   [`Executor::enter_root_phase`] says the process itself now runs inside
//!   the target root (e.g. a first-boot hook).

mod mounts;
mod runner;

pub use mounts::{mounts_under, unmount_under, MountTable, UnmountReport, PROC_MOUNTS, PSEUDO_MOUNTS};
pub use runner::{BackgroundProcess, ChildProcess, CommandRunner, SystemRunner};

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::StageError;
use crate::preflight::EnvironmentProbe;
use crate::process::{Cmd, CommandResult};

/// Package manager whose presence marks a usable root.
pub const PACKAGE_MANAGER: &str = "sbin/apk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    Host,
    Isolated,
}

impl ExecutionContext {
    /// Isolated iff privileged, `chroot` is available and `root` contains the
    /// package manager.
    pub fn detect(root: &Path, probe: &dyn EnvironmentProbe) -> Self {
        let privileged = probe.is_privileged();
        let chroot = probe.has_tool("chroot");
        let populated = root.join(PACKAGE_MANAGER).exists();
        debug!(
            "context detection: privileged={} chroot={} {}={}",
            privileged, chroot, PACKAGE_MANAGER, populated
        );
        if privileged && chroot && populated {
            ExecutionContext::Isolated
        } else {
            ExecutionContext::Host
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::Host => f.write_str("host"),
            ExecutionContext::Isolated => f.write_str("isolated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Preparing the root from outside.
    HostPrep,
    /// The process is running inside the target root.
    InRoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Always runs on the host.
    Host,
    /// Only meaningful inside the target root.
    InRootOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub program: String,
    pub args: Vec<String>,
    pub scope: Scope,
}

impl Operation {
    pub fn host<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(program, args, Scope::Host)
    }

    pub fn in_root<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(program, args, Scope::InRootOnly)
    }

    fn new<I, S>(program: &str, args: I, scope: Scope) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(|a| a.as_ref().to_string()).collect(),
            scope,
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug)]
pub enum Outcome {
    Ran(CommandResult),
    Skipped,
}

impl Outcome {
    pub fn was_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped)
    }
}

pub struct Executor {
    context: ExecutionContext,
    root: PathBuf,
    phase: Phase,
    runner: Arc<dyn CommandRunner>,
    mounts: Arc<Mutex<MountTable>>,
}

fn command_error(cmd: &Cmd, e: impl fmt::Display) -> StageError {
    StageError::Command {
        command: cmd.display(),
        detail: e.to_string(),
    }
}

impl Executor {
    pub fn new(context: ExecutionContext, root: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            context,
            root: root.to_path_buf(),
            phase: Phase::HostPrep,
            runner,
            mounts: Arc::new(Mutex::new(MountTable::new())),
        }
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    /// Shared handle on the mounts this executor created.
    pub fn mount_table(&self) -> Arc<Mutex<MountTable>> {
        Arc::clone(&self.mounts)
    }

    fn lock_mounts(&self) -> MutexGuard<'_, MountTable> {
        self.mounts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declare that the process now runs inside the target root.
    pub fn enter_root_phase(&mut self) {
        info!("entering in-root phase");
        self.phase = Phase::InRoot;
    }

    /// Run `op` according to its scope and the context.
    pub fn run(&self, op: &Operation) -> Result<Outcome, StageError> {
        let cmd = match (op.scope, self.context, self.phase) {
            (Scope::Host, _, _) | (Scope::InRootOnly, ExecutionContext::Host, Phase::InRoot) => {
                Cmd::new(&op.program).args(&op.args)
            }
            (Scope::InRootOnly, ExecutionContext::Isolated, _) => self.chroot(&op.program, &op.args),
            (Scope::InRootOnly, ExecutionContext::Host, Phase::HostPrep) => {
                info!("skipping in-root operation on host: {}", op.display());
                return Ok(Outcome::Skipped);
            }
        };
        debug!("exec [{}] {}", self.context, cmd.display());
        let display = cmd.clone();
        self.runner
            .run(cmd)
            .map(Outcome::Ran)
            .map_err(|e| command_error(&display, e))
    }

    /// Run a program that lives in the root: through chroot when isolated,
    /// otherwise `<root>/<program>` straight from the host.
    pub fn run_in_root_or_host(&self, program: &str, args: &[&str]) -> Result<CommandResult, StageError> {
        let cmd = match self.context {
            ExecutionContext::Isolated => self.chroot(program, args),
            ExecutionContext::Host => {
                let path = self.root.join(program.trim_start_matches('/'));
                Cmd::new(path.to_string_lossy()).args(args)
            }
        };
        debug!("exec [{}] {}", self.context, cmd.display());
        let display = cmd.clone();
        self.runner.run(cmd).map_err(|e| command_error(&display, e))
    }

    fn chroot<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Cmd {
        Cmd::new("chroot")
            .arg_path(&self.root)
            .arg(program)
            .args(args.iter().map(|a| a.as_ref()))
    }

    /// Mount pseudo filesystems and provide DNS inside an isolated root.
    /// Does nothing on the host.
    pub fn prepare_isolation(&self) -> Result<(), StageError> {
        if self.context != ExecutionContext::Isolated {
            return Ok(());
        }
        {
            let mut table = self.lock_mounts();
            if table.is_empty() {
                for (fstype, rel) in PSEUDO_MOUNTS {
                    table
                        .mount(self.runner.as_ref(), &self.root, fstype, rel)
                        .map_err(|detail| StageError::Command {
                            command: format!("mount {fstype}"),
                            detail,
                        })?;
                }
            }
        }

        let host_resolv = Path::new("/etc/resolv.conf");
        if host_resolv.exists() {
            let target = self.root.join("etc/resolv.conf");
            // A dangling symlink from the image would redirect the copy.
            let _ = fs::remove_file(&target);
            fs::copy(host_resolv, &target).map_err(|source| StageError::Io { path: target, source })?;
        }
        Ok(())
    }

    /// Unmount everything under the root.
    pub fn release_isolation(&self) -> UnmountReport {
        self.lock_mounts().unmount_all(self.runner.as_ref(), &self.root)
    }
}
