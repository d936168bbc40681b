//! Check result types shared by preflight and the validator.

use std::time::Duration;

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Check failed - the build cannot proceed / the artifact is not releasable.
    Fail,
    /// Check passed but with a warning.
    Warn,
    /// Check skipped (not applicable on this host).
    Skip,
    /// Informational measurement, never fails.
    Info,
}

impl CheckStatus {
    pub fn label(self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warn => "WARN",
            CheckStatus::Skip => "SKIP",
            CheckStatus::Info => "INFO",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            CheckStatus::Pass => "✓",
            CheckStatus::Fail => "✗",
            CheckStatus::Warn => "⚠",
            CheckStatus::Skip => "○",
            CheckStatus::Info => "·",
        }
    }
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, details: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            status,
            details: details.map(str::to_string),
            duration: None,
        }
    }

    pub fn pass(name: &str) -> Self {
        Self::new(name, CheckStatus::Pass, None)
    }

    pub fn pass_with(name: &str, details: &str) -> Self {
        Self::new(name, CheckStatus::Pass, Some(details))
    }

    pub fn fail(name: &str, details: &str) -> Self {
        Self::new(name, CheckStatus::Fail, Some(details))
    }

    pub fn warn(name: &str, details: &str) -> Self {
        Self::new(name, CheckStatus::Warn, Some(details))
    }

    pub fn skip(name: &str, details: &str) -> Self {
        Self::new(name, CheckStatus::Skip, Some(details))
    }

    pub fn info(name: &str, details: &str) -> Self {
        Self::new(name, CheckStatus::Info, Some(details))
    }

    pub fn timed(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// One report line, without trailing newline.
    pub fn line(&self) -> String {
        let mut line = format!("  {} [{}] {}", self.status.icon(), self.status.label(), self.name);
        if let Some(details) = &self.details {
            line.push_str(": ");
            line.push_str(details);
        }
        line
    }
}

/// Results of all preflight checks.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Returns true if no check failed.
    pub fn all_passed(&self) -> bool {
        self.fail_count() == 0
    }

    fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn fail_count(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    pub fn warn_count(&self) -> usize {
        self.count(CheckStatus::Warn)
    }

    /// Names of the failed checks, comma-separated.
    pub fn failed_names(&self) -> String {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Print the report to stdout.
    pub fn print(&self) {
        println!("=== Preflight Check Results ===\n");
        for check in &self.checks {
            println!("{}", check.line());
        }

        println!();
        let passed = self.count(CheckStatus::Pass);
        println!("Summary: {}/{} passed", passed, self.checks.len());
        if self.fail_count() > 0 {
            println!("         {} FAILED - build will not succeed", self.fail_count());
        }
        if self.warn_count() > 0 {
            println!("         {} warnings", self.warn_count());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let report = PreflightReport {
            checks: vec![
                CheckResult::pass("a"),
                CheckResult::fail("b", "broken"),
                CheckResult::warn("c", "meh"),
                CheckResult::fail("d", "broken"),
            ],
        };
        assert!(!report.all_passed());
        assert_eq!(report.fail_count(), 2);
        assert_eq!(report.warn_count(), 1);
        assert_eq!(report.failed_names(), "b, d");
    }

    #[test]
    fn test_line_format() {
        assert_eq!(CheckResult::skip("x", "n/a").line(), "  ○ [SKIP] x: n/a");
        assert_eq!(CheckResult::pass("y").line(), "  ✓ [PASS] y");
    }
}
