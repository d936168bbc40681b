//! Template build pipeline.
//!
//! Eleven stages run in a fixed order on the calling thread. The build root is
//! owned by a [`BuildRootGuard`] from `PrepareBuildRoot` on; whatever happens
//! afterwards (stage error, cancellation, panic) the guard unmounts, removes
//! scratch space and releases the lock. On success the isolation mounts are
//! released before the outcome is returned, so packaging never sees them.
//!
//! ```text
//! LoadConfig → CheckEnvironment → PrepareBuildRoot → FetchBaseImage →
//! ExtractBaseImage → OptimizeSystem → InstallRuntime →
//! ConfigureRuntimeService → ApplyHardening → FinalCleanup → VerifyBuild
//! ```

mod base;
mod cleanup;
mod guard;
mod harden;
mod runtime;
mod system;
mod verify;

pub use guard::{lock_path, BuildRootGuard, BuildRootLock, CleanupReport};
pub use base::RUNTIME_DISTRIBUTION;
pub use runtime::{RUNTIME_BINARY, RUNTIME_CONFIG, RUNTIME_LINKS};
pub use verify::{critical_paths, missing_paths, parse_runtime_version, SKELETON_DIRS};

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, ImageCache};
use crate::config::BuildConfig;
use crate::error::{BuildError, StageError};
use crate::exec::{mounts_under, unmount_under, CommandRunner, ExecutionContext, Executor, Operation, Outcome};
use crate::preflight::{EnvironmentProbe, PreflightReport};
use crate::timing::{format_duration, Timer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    LoadConfig,
    CheckEnvironment,
    PrepareBuildRoot,
    FetchBaseImage,
    ExtractBaseImage,
    OptimizeSystem,
    InstallRuntime,
    ConfigureRuntimeService,
    ApplyHardening,
    FinalCleanup,
    VerifyBuild,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::LoadConfig,
        Stage::CheckEnvironment,
        Stage::PrepareBuildRoot,
        Stage::FetchBaseImage,
        Stage::ExtractBaseImage,
        Stage::OptimizeSystem,
        Stage::InstallRuntime,
        Stage::ConfigureRuntimeService,
        Stage::ApplyHardening,
        Stage::FinalCleanup,
        Stage::VerifyBuild,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::LoadConfig => "LoadConfig",
            Stage::CheckEnvironment => "CheckEnvironment",
            Stage::PrepareBuildRoot => "PrepareBuildRoot",
            Stage::FetchBaseImage => "FetchBaseImage",
            Stage::ExtractBaseImage => "ExtractBaseImage",
            Stage::OptimizeSystem => "OptimizeSystem",
            Stage::InstallRuntime => "InstallRuntime",
            Stage::ConfigureRuntimeService => "ConfigureRuntimeService",
            Stage::ApplyHardening => "ApplyHardening",
            Stage::FinalCleanup => "FinalCleanup",
            Stage::VerifyBuild => "VerifyBuild",
        }
    }

    /// 1-based position in the run.
    pub fn number(self) -> usize {
        Stage::ALL.iter().position(|s| *s == self).map_or(0, |i| i + 1)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared cancellation flag, checked before every stage.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A stage failed; `source` is why.
#[derive(Debug, Error)]
#[error("stage {stage} failed: {source}")]
pub struct PipelineFailure {
    pub stage: Stage,
    #[source]
    pub source: BuildError,
}

impl PipelineFailure {
    pub fn exit_code(&self) -> i32 {
        self.source.exit_code()
    }
}

/// A finished build. The build root stays locked until the outcome is
/// finished or dropped; then it is removed unless `build.keep_build_root`.
pub struct BuildOutcome {
    pub build_root: PathBuf,
    pub context: ExecutionContext,
    pub base_version: String,
    pub runtime_version: String,
    pub preflight: PreflightReport,
    pub stage_durations: Vec<(Stage, Duration)>,
    /// In-root operations that were skipped because the build ran on the host.
    pub skipped_operations: Vec<String>,
    guard: BuildRootGuard,
}

impl std::fmt::Debug for BuildOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOutcome")
            .field("build_root", &self.build_root)
            .field("context", &self.context)
            .field("base_version", &self.base_version)
            .field("runtime_version", &self.runtime_version)
            .field("preflight", &self.preflight)
            .field("stage_durations", &self.stage_durations)
            .field("skipped_operations", &self.skipped_operations)
            .finish_non_exhaustive()
    }
}

impl BuildOutcome {
    pub fn total_duration(&self) -> Duration {
        self.stage_durations.iter().map(|(_, d)| *d).sum()
    }

    /// Release the build root now.
    pub fn finish(mut self) -> CleanupReport {
        self.guard.cleanup()
    }
}

/// Mutable state threaded through the stages of one run.
pub(crate) struct BuildState<'a> {
    pub config: &'a BuildConfig,
    pub cache: &'a ImageCache,
    pub probe: &'a dyn EnvironmentProbe,
    pub runner: Arc<dyn CommandRunner>,
    pub guard: Option<BuildRootGuard>,
    pub preflight: Option<PreflightReport>,
    pub base_version: Option<String>,
    pub base_image: Option<CacheEntry>,
    pub runtime_binary: Option<CacheEntry>,
    pub executor: Option<Executor>,
    pub installed_version: Option<String>,
    pub skipped: Vec<String>,
}

impl<'a> BuildState<'a> {
    pub fn root(&self) -> &Path {
        &self.config.build.build_root
    }

    /// `<build_root>.work`, removed by the guard.
    pub fn scratch(&self) -> PathBuf {
        let mut name = self.root().as_os_str().to_os_string();
        name.push(".work");
        PathBuf::from(name)
    }

    pub fn executor(&self, stage: Stage) -> Result<&Executor, StageError> {
        self.executor.as_ref().ok_or(StageError::OutOfOrder {
            stage: stage.name(),
            missing: "the execution context",
        })
    }

    /// Run an operation, remembering it when the context skipped it.
    pub fn exec(&mut self, stage: Stage, op: &Operation) -> Result<Outcome, StageError> {
        let outcome = self.executor(stage)?.run(op)?;
        if outcome.was_skipped() {
            self.skipped.push(op.display());
        }
        Ok(outcome)
    }

    pub fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StageError + '_ {
        move |source| StageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub struct BuildPipeline {
    config: Arc<BuildConfig>,
    cache: Arc<ImageCache>,
    probe: Arc<dyn EnvironmentProbe>,
    runner: Arc<dyn CommandRunner>,
    cancel: CancelToken,
}

impl BuildPipeline {
    pub fn new(
        config: Arc<BuildConfig>,
        cache: Arc<ImageCache>,
        probe: Arc<dyn EnvironmentProbe>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            cache,
            probe,
            runner,
            cancel: CancelToken::new(),
        }
    }

    /// Use an externally owned token (e.g. tripped by a signal handler).
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Run every stage in order.
    pub fn run(&self) -> Result<BuildOutcome, PipelineFailure> {
        let total = Stage::ALL.len();
        let mut state = BuildState {
            config: &self.config,
            cache: &self.cache,
            probe: self.probe.as_ref(),
            runner: Arc::clone(&self.runner),
            guard: None,
            preflight: None,
            base_version: None,
            base_image: None,
            runtime_binary: None,
            executor: None,
            installed_version: None,
            skipped: Vec::new(),
        };
        let mut durations = Vec::with_capacity(total);

        println!(
            "Building {} {} ({})",
            self.config.template.name, self.config.template.version, self.config.template.architecture
        );

        for stage in Stage::ALL {
            let result = if self.cancel.is_cancelled() {
                Err(BuildError::from(StageError::Cancelled))
            } else {
                println!("[{}/{}] {}", stage.number(), total, stage);
                let timer = Timer::start(stage.name());
                let result = run_stage(stage, &mut state);
                durations.push((stage, timer.finish()));
                result
            };

            if let Err(source) = result {
                warn!("stage {} failed: {}", stage, source);
                if let Some(mut guard) = state.guard.take() {
                    // Keep the tree for post-mortem; everything else goes.
                    guard.remove_root_on_cleanup(false);
                    guard.cleanup();
                }
                return Err(PipelineFailure { stage, source });
            }
        }

        if let Err(source) = release_build_root(&state) {
            warn!("could not release {}: {}", state.root().display(), source);
            if let Some(mut guard) = state.guard.take() {
                guard.remove_root_on_cleanup(false);
                guard.cleanup();
            }
            return Err(PipelineFailure {
                stage: Stage::VerifyBuild,
                source: source.into(),
            });
        }

        let Some(mut guard) = state.guard.take() else {
            return Err(PipelineFailure {
                stage: Stage::PrepareBuildRoot,
                source: StageError::OutOfOrder {
                    stage: "BuildPipeline",
                    missing: "the build root guard",
                }
                .into(),
            });
        };
        guard.remove_root_on_cleanup(!self.config.build.keep_build_root);

        let outcome = BuildOutcome {
            build_root: self.config.build.build_root.clone(),
            context: state.executor.as_ref().map_or(ExecutionContext::Host, Executor::context),
            base_version: state.base_version.take().unwrap_or_default(),
            runtime_version: state.installed_version.take().unwrap_or_default(),
            preflight: state.preflight.take().unwrap_or_default(),
            stage_durations: durations,
            skipped_operations: std::mem::take(&mut state.skipped),
            guard,
        };
        info!("build finished in {}", format_duration(outcome.total_duration()));
        if !outcome.skipped_operations.is_empty() {
            warn!(
                "{} in-root operation(s) skipped on host: {}",
                outcome.skipped_operations.len(),
                outcome.skipped_operations.join("; ")
            );
        }
        Ok(outcome)
    }
}

fn run_stage(stage: Stage, state: &mut BuildState<'_>) -> Result<(), BuildError> {
    match stage {
        Stage::LoadConfig => load_config(state),
        Stage::CheckEnvironment => check_environment(state),
        Stage::PrepareBuildRoot => prepare_build_root(state),
        Stage::FetchBaseImage => base::fetch_base_image(state),
        Stage::ExtractBaseImage => base::extract_base_image(state).map_err(Into::into),
        Stage::OptimizeSystem => system::optimize_system(state).map_err(Into::into),
        Stage::InstallRuntime => runtime::install_runtime(state).map_err(Into::into),
        Stage::ConfigureRuntimeService => runtime::configure_service(state).map_err(Into::into),
        Stage::ApplyHardening => harden::apply_hardening(state).map_err(Into::into),
        Stage::FinalCleanup => cleanup::final_cleanup(state).map_err(Into::into),
        Stage::VerifyBuild => verify::verify_build(state).map_err(Into::into),
    }
}

fn load_config(state: &mut BuildState<'_>) -> Result<(), BuildError> {
    state.config.validate()?;
    let config = state.config;
    info!(
        "template {} {} ({}), base {}, k3s {}",
        config.template.name,
        config.template.version,
        config.template.architecture,
        config.base_image,
        config.runtime.version
    );
    Ok(())
}

fn check_environment(state: &mut BuildState<'_>) -> Result<(), BuildError> {
    let report = crate::preflight::run_preflight_or_fail(state.config, state.probe)?;
    if report.warn_count() > 0 {
        for check in report.checks.iter().filter(|c| c.status == crate::preflight::CheckStatus::Warn) {
            warn!("preflight: {}", check.line().trim());
        }
    }
    state.preflight = Some(report);
    Ok(())
}

fn prepare_build_root(state: &mut BuildState<'_>) -> Result<(), BuildError> {
    let root = state.root().to_path_buf();
    let mut guard = BuildRootGuard::acquire(&root)?;

    if root.exists() {
        release_stale_mounts(state)?;
        info!("removing previous build root {}", root.display());
        fs::remove_dir_all(&root).map_err(BuildState::io(&root))?;
    }
    fs::create_dir_all(&root).map_err(BuildState::io(&root))?;

    let scratch = state.scratch();
    if scratch.exists() {
        fs::remove_dir_all(&scratch).map_err(BuildState::io(&scratch))?;
    }
    fs::create_dir_all(&scratch).map_err(BuildState::io(&scratch))?;
    guard.add_scratch(scratch);

    state.guard = Some(guard);
    Ok(())
}

/// Mounts the kernel reports at or below the build root.
fn live_mounts(state: &BuildState<'_>) -> Vec<PathBuf> {
    state
        .probe
        .active_mounts()
        .map(|text| mounts_under(&text, state.root()))
        .unwrap_or_default()
}

/// Unmount what an interrupted earlier run left in the build root. Deleting
/// through a bind mount would delete the host's files.
fn release_stale_mounts(state: &BuildState<'_>) -> Result<(), StageError> {
    let Some(text) = state.probe.active_mounts() else {
        return Ok(());
    };
    let report = unmount_under(state.runner.as_ref(), &text, state.root());
    if report.unmounted > 0 {
        warn!("unmounted {} stale mount(s) under {}", report.unmounted, state.root().display());
    }
    let remaining = live_mounts(state);
    if remaining.is_empty() {
        Ok(())
    } else {
        Err(StageError::StillMounted {
            root: state.root().to_path_buf(),
            mounts: remaining,
        })
    }
}

/// Tear down isolation mounts before the root is handed to packaging.
fn release_build_root(state: &BuildState<'_>) -> Result<(), StageError> {
    let mut busy = Vec::new();
    if let Some(executor) = state.executor.as_ref() {
        let released = executor.release_isolation();
        debug!("released {} mount(s) under {}", released.unmounted, state.root().display());
        busy = released.busy;
    }
    for mount in live_mounts(state) {
        if !busy.contains(&mount) {
            busy.push(mount);
        }
    }
    if busy.is_empty() {
        Ok(())
    } else {
        Err(StageError::StillMounted {
            root: state.root().to_path_buf(),
            mounts: busy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_fixed() {
        let names: Vec<&str> = Stage::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names.first(), Some(&"LoadConfig"));
        assert_eq!(names.last(), Some(&"VerifyBuild"));
        assert!(Stage::FetchBaseImage < Stage::ExtractBaseImage);
        assert_eq!(Stage::ExtractBaseImage.number(), 5);
        assert_eq!(Stage::VerifyBuild.number(), 11);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
