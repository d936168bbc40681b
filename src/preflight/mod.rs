//! Preflight checks for a template build.
//!
//! Validates privilege, disk space, host tools and kernel features before
//! anything touches the build root. Run with `rootsmith preflight` to check
//! a host without building.

mod probe;
mod types;

use std::fs;
use std::path::Path;
use tracing::debug;

use crate::config::{BuildConfig, ImageFormat};
use crate::error::EnvironmentError;

pub use probe::{parse_df_avail, EnvironmentProbe, SystemProbe};
pub use types::{CheckResult, CheckStatus, PreflightReport};

/// A check outcome plus the typed error it maps to when it fails.
type Finding = (CheckResult, Option<EnvironmentError>);

fn check_privilege(config: &BuildConfig, probe: &dyn EnvironmentProbe) -> Finding {
    if probe.is_privileged() {
        return (CheckResult::pass_with("privilege", "running as root"), None);
    }
    if !config.build.require_root {
        return (
            CheckResult::warn(
                "privilege",
                "not root; in-root package operations will be skipped",
            ),
            None,
        );
    }
    let reason = "root is required to mount and chroot into the build root \
                  (set build.require_root: false to build unprivileged)";
    (
        CheckResult::fail("privilege", reason),
        Some(EnvironmentError::InsufficientPrivilege {
            reason: reason.to_string(),
        }),
    )
}

fn check_disk(config: &BuildConfig, probe: &dyn EnvironmentProbe) -> Finding {
    let path = &config.build.build_root;
    let required = config.build.min_free_disk_mb;
    match probe.free_disk_mb(path) {
        Some(available) if available >= required => (
            CheckResult::pass_with("disk space", &format!("{available} MB free")),
            None,
        ),
        Some(available) => (
            CheckResult::fail(
                "disk space",
                &format!("{available} MB free, {required} MB required"),
            ),
            Some(EnvironmentError::InsufficientDiskSpace {
                path: path.clone(),
                available_mb: available,
                required_mb: required,
            }),
        ),
        None => (
            CheckResult::warn("disk space", "could not determine free space"),
            None,
        ),
    }
}

fn check_tool(probe: &dyn EnvironmentProbe, program: &str, hint: &str) -> Finding {
    if probe.has_tool(program) {
        (CheckResult::pass(program), None)
    } else {
        (
            CheckResult::fail(program, &format!("not found in PATH ({hint})")),
            Some(EnvironmentError::MissingCapability {
                capability: program.to_string(),
                hint: hint.to_string(),
            }),
        )
    }
}

fn check_host_tools(config: &BuildConfig, probe: &dyn EnvironmentProbe) -> Vec<Finding> {
    let mut findings = vec![check_tool(probe, "curl", "needed to download base images")];

    // A privileged run isolates whether or not root was required.
    if config.build.require_root || probe.is_privileged() {
        for tool in ["chroot", "mount", "umount"] {
            findings.push(check_tool(probe, tool, "needed for isolated builds (util-linux)"));
        }
    } else {
        findings.push((
            CheckResult::skip("chroot", "isolation not required"),
            None,
        ));
    }

    if config.build.image_format == ImageFormat::Squashfs {
        findings.push(check_tool(
            probe,
            "mksquashfs",
            "install squashfs-tools or use image_format: tar-gz",
        ));
    }
    findings
}

fn check_kernel(probe: &dyn EnvironmentProbe) -> Vec<Finding> {
    let overlay = match probe.kernel_filesystems() {
        Some(fs) if fs.lines().any(|l| l.split_whitespace().last() == Some("overlay")) => {
            CheckResult::pass("overlay filesystem")
        }
        Some(_) => CheckResult::warn("overlay filesystem", "not listed in /proc/filesystems; k3s containerd needs it"),
        None => CheckResult::warn("overlay filesystem", "/proc/filesystems unreadable"),
    };
    let cgroups = if probe.cgroups_mounted() {
        CheckResult::pass("cgroups")
    } else {
        CheckResult::warn("cgroups", "no cgroup hierarchy mounted; functional validation will fail")
    };
    vec![(overlay, None), (cgroups, None)]
}

fn check_output_dir(output_dir: &Path) -> Finding {
    let name = "output directory writable";
    let result = fs::create_dir_all(output_dir).and_then(|_| {
        let marker = output_dir.join(".preflight-test");
        fs::write(&marker, "test")?;
        fs::remove_file(&marker)
    });
    match result {
        Ok(()) => (CheckResult::pass(name), None),
        Err(e) => (
            CheckResult::fail(name, &format!("{}: {}", output_dir.display(), e)),
            Some(EnvironmentError::MissingCapability {
                capability: "writable output directory".to_string(),
                hint: e.to_string(),
            }),
        ),
    }
}

fn findings(config: &BuildConfig, probe: &dyn EnvironmentProbe) -> Vec<Finding> {
    let mut all = vec![check_privilege(config, probe), check_disk(config, probe)];
    all.extend(check_host_tools(config, probe));
    all.extend(check_kernel(probe));
    all.push(check_output_dir(&config.build.output_dir));
    all
}

/// Run all checks and collect the report.
pub fn run_preflight(config: &BuildConfig, probe: &dyn EnvironmentProbe) -> PreflightReport {
    PreflightReport {
        checks: findings(config, probe).into_iter().map(|(check, _)| check).collect(),
    }
}

/// Run all checks; fail with the first failure's typed error.
///
/// Privilege and disk problems keep their own variants so the binary can map
/// them to distinct exit codes.
pub fn run_preflight_or_fail(
    config: &BuildConfig,
    probe: &dyn EnvironmentProbe,
) -> Result<PreflightReport, EnvironmentError> {
    let mut first_error = None;
    let mut checks = Vec::new();
    for (check, error) in findings(config, probe) {
        debug!("preflight: {}", check.line().trim());
        if first_error.is_none() {
            first_error = error;
        }
        checks.push(check);
    }
    let report = PreflightReport { checks };

    if report.all_passed() {
        return Ok(report);
    }
    report.print();
    Err(first_error.unwrap_or_else(|| EnvironmentError::Preflight {
        failed: report.fail_count(),
        summary: report.failed_names(),
    }))
}
