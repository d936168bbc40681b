//! Preflight command - runs preflight checks.

use anyhow::Result;
use std::path::Path;

use super::load_config;
use rootsmith::preflight::{self, SystemProbe};

/// Execute the preflight command.
pub fn cmd_preflight(config_path: &Path, strict: bool) -> Result<()> {
    let config = load_config(config_path)?;
    if strict {
        let report = preflight::run_preflight_or_fail(&config, &SystemProbe)?;
        report.print();
    } else {
        let report = preflight::run_preflight(&config, &SystemProbe);
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to fail with an error.");
        }
    }
    Ok(())
}
