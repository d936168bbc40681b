//! The seam between the executor and real processes.

use std::process::Child;
use tracing::debug;

use crate::process::{Cmd, CommandError, CommandResult};

/// A command left running in the background.
pub trait BackgroundProcess: Send {
    /// Kill and reap it. Later calls do nothing.
    fn stop(&mut self);
}

/// Runs a fully built command.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: Cmd) -> Result<CommandResult, CommandError>;

    /// Start `cmd` without waiting for it. The caller stops it.
    fn spawn(&self, cmd: Cmd) -> Result<Box<dyn BackgroundProcess>, CommandError>;
}

/// A real child process. Stopped on drop.
pub struct ChildProcess(Option<Child>);

impl BackgroundProcess for ChildProcess {
    fn stop(&mut self) {
        if let Some(mut child) = self.0.take() {
            if let Err(e) = child.kill() {
                debug!("process already exited: {}", e);
            }
            let _ = child.wait();
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: Cmd) -> Result<CommandResult, CommandError> {
        cmd.run()
    }

    fn spawn(&self, cmd: Cmd) -> Result<Box<dyn BackgroundProcess>, CommandError> {
        let child = cmd.spawn()?;
        Ok(Box::new(ChildProcess(Some(child))))
    }
}
