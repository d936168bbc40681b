//! Validate command - checks a packaged artifact.

use anyhow::{bail, Result};
use std::path::Path;
use std::time::Duration;

use rootsmith::validate::{validate, ValidateOptions};

pub fn cmd_validate(artifact: &Path, functional: bool, require_functional: bool, timeout_secs: u64) -> Result<()> {
    let options = ValidateOptions {
        functional: functional || require_functional,
        require_functional,
        timeout: Duration::from_secs(timeout_secs),
        ..Default::default()
    };
    let report = validate(artifact, &options)?;
    report.print();
    if !report.passed() {
        bail!("{} validation check(s) failed", report.failures().len());
    }
    Ok(())
}
