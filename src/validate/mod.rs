//! Post-build verification of a packaged template.
//!
//! Problems with the artifact are reported as failing checks in the
//! [`ValidationReport`]; `Err` only means validation could not start.

mod functional;

pub use functional::{ready_node, run_functional, FunctionalOutcome};

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::common::archive::list_tar_gz;
use crate::common::hash::{hash_file, DigestAlgorithm};
use crate::common::{cleanup_work_dir, prepare_work_dir, tree_stats, unpack_tar_gz};
use crate::config::validate::runtime_version;
use crate::exec::{CommandRunner, SystemRunner};
use crate::error::ValidationError;
use crate::package::{checksum_path, ImageMetadata, Manifest, MANIFEST_FILE, METADATA_FILE, README_FILE};
use crate::pipeline::{critical_paths, missing_paths};
use crate::preflight::{CheckResult, CheckStatus, EnvironmentProbe, SystemProbe};
use crate::process::Cmd;
use crate::timing::format_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Integrity,
    Metadata,
    Structure,
    Functional,
    Performance,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::Integrity => "integrity",
            Category::Metadata => "metadata",
            Category::Structure => "structure",
            Category::Functional => "functional",
            Category::Performance => "performance",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationCheck {
    pub category: Category,
    pub result: CheckResult,
}

#[derive(Debug, Clone, Default)]
pub struct Timings {
    pub phases: Vec<(String, Duration)>,
    pub files: u64,
    pub dirs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub artifact: PathBuf,
    pub checks: Vec<ValidationCheck>,
    pub timings: Timings,
}

impl ValidationReport {
    fn push(&mut self, category: Category, result: CheckResult) {
        self.checks.push(ValidationCheck { category, result });
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.result.status == status).count()
    }

    /// Releasable iff nothing failed.
    pub fn passed(&self) -> bool {
        self.count(CheckStatus::Fail) == 0
    }

    pub fn in_category(&self, category: Category) -> impl Iterator<Item = &ValidationCheck> {
        self.checks.iter().filter(move |c| c.category == category)
    }

    pub fn failures(&self) -> Vec<&ValidationCheck> {
        self.checks.iter().filter(|c| c.result.status == CheckStatus::Fail).collect()
    }

    pub fn print(&self) {
        println!("=== Validation: {} ===\n", self.artifact.display());
        let mut current = None;
        for check in &self.checks {
            if current != Some(check.category) {
                println!("[{}]", check.category);
                current = Some(check.category);
            }
            println!("{}", check.result.line());
        }
        println!();
        println!(
            "Summary: {} passed, {} failed, {} warnings, {} skipped",
            self.count(CheckStatus::Pass),
            self.count(CheckStatus::Fail),
            self.count(CheckStatus::Warn),
            self.count(CheckStatus::Skip)
        );
        for (phase, duration) in &self.timings.phases {
            println!("  {:<12} {}", phase, format_duration(*duration));
        }
        if self.passed() {
            println!("Artifact is releasable.");
        } else {
            println!("Artifact is NOT releasable.");
        }
    }
}

pub struct ValidateOptions {
    pub functional: bool,
    /// Fail instead of skip when the host cannot run the functional check.
    pub require_functional: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub scratch_dir: Option<PathBuf>,
    pub probe: Arc<dyn EnvironmentProbe>,
    pub runner: Arc<dyn CommandRunner>,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            functional: false,
            require_functional: false,
            timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(5),
            scratch_dir: None,
            probe: Arc::new(SystemProbe),
            runner: Arc::new(SystemRunner),
        }
    }
}

static RUNS: AtomicUsize = AtomicUsize::new(0);

struct Scratch(PathBuf);

impl Drop for Scratch {
    fn drop(&mut self) {
        cleanup_work_dir(&self.0);
    }
}

pub fn validate(artifact: &Path, options: &ValidateOptions) -> Result<ValidationReport, ValidationError> {
    if !artifact.is_file() {
        return Err(ValidationError::ArtifactNotFound(artifact.to_path_buf()));
    }
    let parent = options.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);
    let name = format!(
        "rootsmith-validate-{}-{}",
        std::process::id(),
        RUNS.fetch_add(1, Ordering::Relaxed)
    );
    let scratch = Scratch(prepare_work_dir(&parent, &name).map_err(ValidationError::Scratch)?);

    let mut report = ValidationReport {
        artifact: artifact.to_path_buf(),
        ..Default::default()
    };
    let started = Instant::now();

    let Some(unpacked) = check_integrity(artifact, &scratch.0, &mut report) else {
        report.timings.phases.push(("total".into(), started.elapsed()));
        return Ok(report);
    };
    let metadata = check_metadata(&unpacked, &mut report);
    let root = check_structure(&unpacked, metadata.as_ref(), &scratch.0, options, &mut report);

    if let Some(root) = root {
        check_functional(&root, options, &mut report);
    } else if options.functional {
        report.push(
            Category::Functional,
            CheckResult::skip("runtime boots", "root filesystem unavailable"),
        );
    }

    report.timings.phases.push(("total".into(), started.elapsed()));
    info!(
        "validated {}: {} failure(s)",
        artifact.display(),
        report.count(CheckStatus::Fail)
    );
    Ok(report)
}

/// Archive readable, members present, checksums match. Returns the
/// directory the members were unpacked to when the archive opened.
fn check_integrity(artifact: &Path, scratch: &Path, report: &mut ValidationReport) -> Option<PathBuf> {
    let names = match list_tar_gz(artifact) {
        Ok(names) => {
            report.push(Category::Integrity, CheckResult::pass_with("archive opens", &format!("{} entries", names.len())));
            names
        }
        Err(e) => {
            report.push(Category::Integrity, CheckResult::fail("archive opens", &e.to_string()));
            return None;
        }
    };

    let has = |member: &str| names.iter().any(|n| n == member);
    let image_present = has("rootfs.tar.gz") || has("rootfs.squashfs");
    let mut missing: Vec<&str> = [METADATA_FILE, MANIFEST_FILE, README_FILE]
        .into_iter()
        .filter(|m| !has(*m))
        .collect();
    if !image_present {
        missing.insert(0, "rootfs image");
    }
    if missing.is_empty() {
        report.push(Category::Integrity, CheckResult::pass("members present"));
    } else {
        report.push(Category::Integrity, CheckResult::fail("members present", &format!("missing {}", missing.join(", "))));
    }

    let mut any = false;
    for algorithm in DigestAlgorithm::ALL {
        let sibling = checksum_path(artifact, algorithm);
        let Ok(text) = fs::read_to_string(&sibling) else {
            continue;
        };
        any = true;
        let name = format!("{} checksum", algorithm.name());
        let expected = text.split_whitespace().next().unwrap_or_default().to_ascii_lowercase();
        match hash_file(artifact, algorithm) {
            Ok(actual) if actual == expected => report.push(Category::Integrity, CheckResult::pass(&name)),
            Ok(actual) => report.push(
                Category::Integrity,
                CheckResult::fail(&name, &format!("expected {expected}, got {actual}")),
            ),
            Err(e) => report.push(Category::Integrity, CheckResult::fail(&name, &e.to_string())),
        }
    }
    if !any {
        report.push(Category::Integrity, CheckResult::warn("checksums", "no checksum files next to the artifact"));
    }

    let dest = scratch.join("artifact");
    if let Err(e) = unpack_tar_gz(artifact, &dest) {
        report.push(Category::Integrity, CheckResult::fail("archive unpacks", &e.to_string()));
        return None;
    }
    Some(dest)
}

fn check_metadata(unpacked: &Path, report: &mut ValidationReport) -> Option<ImageMetadata> {
    match read_manifest(&unpacked.join(MANIFEST_FILE)) {
        Ok(manifest) => {
            let missing = manifest.missing_fields();
            if missing.is_empty() {
                report.push(Category::Metadata, CheckResult::pass_with("manifest fields", &format!("{} {}", manifest.name, manifest.version)));
            } else {
                report.push(Category::Metadata, CheckResult::fail("manifest fields", &format!("empty: {}", missing.join(", "))));
            }
            match runtime_version("runtime_version", &manifest.runtime_version) {
                Ok(()) => report.push(Category::Metadata, CheckResult::pass_with("runtime version", &manifest.runtime_version)),
                Err(e) => report.push(Category::Metadata, CheckResult::fail("runtime version", &e.to_string())),
            }
            let image = unpacked.join(&manifest.image.file);
            if !manifest.image.sha256.is_empty() && image.is_file() {
                match hash_file(&image, DigestAlgorithm::Sha256) {
                    Ok(actual) if actual == manifest.image.sha256 => {
                        report.push(Category::Integrity, CheckResult::pass("inner image digest"))
                    }
                    Ok(actual) => report.push(
                        Category::Integrity,
                        CheckResult::fail("inner image digest", &format!("manifest {}, actual {actual}", manifest.image.sha256)),
                    ),
                    Err(e) => report.push(Category::Integrity, CheckResult::fail("inner image digest", &e.to_string())),
                }
            }
        }
        Err(detail) => report.push(Category::Metadata, CheckResult::fail("manifest parses", &detail)),
    }

    let path = unpacked.join(METADATA_FILE);
    let parsed = fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_yaml::from_str::<ImageMetadata>(&text).map_err(|e| e.to_string()));
    match parsed {
        Ok(metadata) => {
            report.push(Category::Metadata, CheckResult::pass_with("metadata parses", &metadata.architecture));
            Some(metadata)
        }
        Err(detail) => {
            report.push(Category::Metadata, CheckResult::fail("metadata parses", &detail));
            None
        }
    }
}

pub fn read_manifest(path: &Path) -> Result<Manifest, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))
}

/// Unpack the inner image, check critical paths, record performance.
fn check_structure(
    unpacked: &Path,
    metadata: Option<&ImageMetadata>,
    scratch: &Path,
    options: &ValidateOptions,
    report: &mut ValidationReport,
) -> Option<PathBuf> {
    let image_name = metadata.map(|m| m.image.clone()).unwrap_or_else(|| {
        if unpacked.join("rootfs.squashfs").exists() {
            "rootfs.squashfs".into()
        } else {
            "rootfs.tar.gz".into()
        }
    });
    let image = unpacked.join(&image_name);
    let root = scratch.join("rootfs");

    let started = Instant::now();
    let result = if image_name.ends_with(".squashfs") {
        let cmd = Cmd::new("unsquashfs").args(["-f", "-d"]).arg_path(&root).arg_path(&image);
        options.runner.run(cmd).map(|_| ()).map_err(|e| e.to_string())
    } else {
        unpack_tar_gz(&image, &root).map_err(|e| e.to_string())
    };
    let unpack_time = started.elapsed();
    if let Err(detail) = result {
        report.push(Category::Structure, CheckResult::fail("inner image unpacks", &detail));
        return None;
    }
    report.push(Category::Structure, CheckResult::pass_with("inner image unpacks", &image_name).timed(unpack_time));

    let service = metadata.map_or("k3s", |m| m.runtime_service.as_str());
    let missing = missing_paths(&root, &critical_paths(service));
    if missing.is_empty() {
        report.push(Category::Structure, CheckResult::pass("critical paths"));
    } else {
        report.push(Category::Structure, CheckResult::fail("critical paths", &format!("missing {}", missing.join(", "))));
    }

    report.timings.phases.push(("unpack".into(), unpack_time));
    report.push(
        Category::Performance,
        CheckResult::info("unpack time", &format_duration(unpack_time)),
    );
    match tree_stats(&root) {
        Ok(stats) => {
            report.timings.files = stats.files;
            report.timings.dirs = stats.dirs;
            report.push(Category::Performance, CheckResult::info("file count", &stats.files.to_string()));
            report.push(Category::Performance, CheckResult::info("directory count", &stats.dirs.to_string()));
        }
        Err(e) => report.push(Category::Performance, CheckResult::info("file count", &format!("unavailable: {e}"))),
    }
    Some(root)
}

fn check_functional(root: &Path, options: &ValidateOptions, report: &mut ValidationReport) {
    const NAME: &str = "runtime boots";
    if !options.functional {
        return;
    }
    let capable = options.probe.is_privileged() && options.probe.has_tool("chroot") && options.probe.cgroups_mounted();
    if !capable {
        let detail = "needs root, chroot and mounted cgroups";
        if options.require_functional {
            report.push(Category::Functional, CheckResult::fail(NAME, detail));
        } else {
            report.push(Category::Functional, CheckResult::skip(NAME, detail));
        }
        return;
    }

    let started = Instant::now();
    let outcome = run_functional(root, Arc::clone(&options.runner), options.timeout, options.poll_interval);
    let elapsed = started.elapsed();
    report.timings.phases.push(("functional".into(), elapsed));
    let result = match outcome {
        FunctionalOutcome::Ready { polls, node } => {
            CheckResult::pass_with(NAME, &format!("node {node} Ready after {polls} poll(s)"))
        }
        FunctionalOutcome::TimedOut { polls, last } => CheckResult::fail(
            NAME,
            &format!("no Ready node after {polls} poll(s) in {}s: {last}", options.timeout.as_secs()),
        ),
        FunctionalOutcome::StartFailed(detail) => CheckResult::fail(NAME, &detail),
    };
    report.push(Category::Functional, result.timed(elapsed));
}
