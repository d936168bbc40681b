//! Boot the runtime inside an unpacked template and wait for a Ready node.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::exec::{BackgroundProcess, CommandRunner, ExecutionContext, Executor};
use crate::pipeline::RUNTIME_BINARY;
use crate::process::Cmd;

/// Stops the runtime however the check ends.
struct RuntimeProcess(Box<dyn BackgroundProcess>);

impl Drop for RuntimeProcess {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Outcome of a functional run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionalOutcome {
    /// A node reported Ready after this many polls.
    Ready { polls: u32, node: String },
    /// No node became Ready in time; the last poll output, if any.
    TimedOut { polls: u32, last: String },
    /// The runtime could not be started.
    StartFailed(String),
}

/// Name of the first node whose STATUS column is `Ready`.
pub fn ready_node(get_nodes: &str) -> Option<String> {
    get_nodes.lines().find_map(|line| {
        let mut cols = line.split_whitespace();
        let name = cols.next()?;
        let status = cols.next()?;
        status
            .split(',')
            .any(|s| s == "Ready")
            .then(|| name.to_string())
    })
}

/// Start `k3s server` chrooted into `root` and poll until a node is Ready or
/// `timeout` elapses.
pub fn run_functional(
    root: &Path,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    interval: Duration,
) -> FunctionalOutcome {
    let executor = Executor::new(ExecutionContext::Isolated, root, Arc::clone(&runner));
    if let Err(e) = executor.prepare_isolation() {
        executor.release_isolation();
        return FunctionalOutcome::StartFailed(e.to_string());
    }
    let outcome = poll_runtime(root, &executor, timeout, interval);
    let released = executor.release_isolation();
    debug!("released {} mount(s) after functional check", released.unmounted);
    if !released.is_clean() {
        warn!("still mounted after functional check: {:?}", released.busy);
    }
    outcome
}

fn poll_runtime(root: &Path, executor: &Executor, timeout: Duration, interval: Duration) -> FunctionalOutcome {
    let binary = format!("/{RUNTIME_BINARY}");
    let server = Cmd::new("chroot")
        .arg_path(root)
        .args([binary.as_str(), "server", "--write-kubeconfig-mode", "0644"]);
    let _runtime = match executor.runner().spawn(server) {
        Ok(process) => RuntimeProcess(process),
        Err(e) => return FunctionalOutcome::StartFailed(e.to_string()),
    };
    info!("k3s server started in {}, waiting up to {}s", root.display(), timeout.as_secs());

    let deadline = Instant::now() + timeout;
    let mut polls = 0;
    let mut last = String::new();
    while Instant::now() < deadline {
        thread::sleep(interval.min(deadline.saturating_duration_since(Instant::now())));
        polls += 1;
        let cmd = Cmd::new("chroot")
            .arg_path(root)
            .args([binary.as_str(), "kubectl", "get", "nodes", "--no-headers"])
            .allow_fail();
        match executor.runner().run(cmd) {
            Ok(result) => {
                if let Some(node) = ready_node(&result.stdout) {
                    return FunctionalOutcome::Ready { polls, node };
                }
                last = if result.stdout_trimmed().is_empty() {
                    result.stderr_trimmed().to_string()
                } else {
                    result.stdout_trimmed().to_string()
                };
            }
            Err(e) => {
                warn!("node poll failed: {}", e);
                last = e.to_string();
            }
        }
    }
    FunctionalOutcome::TimedOut { polls, last }
}
