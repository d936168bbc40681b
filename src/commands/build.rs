//! Build command - runs the template pipeline.

use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use super::load_config;
use rootsmith::cache::{CurlTransport, ImageCache};
use rootsmith::exec::SystemRunner;
use rootsmith::package;
use rootsmith::preflight::SystemProbe;
use rootsmith::timing::format_duration;
use rootsmith::validate::{validate, ValidateOptions};
use rootsmith::{BuildPipeline, CancelToken};

pub struct BuildRequest<'a> {
    pub config_path: &'a Path,
    pub package: bool,
    pub validate: bool,
    pub functional: bool,
}

/// Execute the build command.
pub fn cmd_build(request: BuildRequest<'_>, cancel: CancelToken) -> Result<()> {
    let build_start = Instant::now();
    let config = load_config(request.config_path)?;
    let cache = Arc::new(ImageCache::from_config(&config, Arc::new(CurlTransport::default()))?);
    let pipeline = BuildPipeline::new(Arc::clone(&config), cache, Arc::new(SystemProbe), Arc::new(SystemRunner))
        .with_cancel_token(cancel);

    let outcome = pipeline.run()?;
    println!("\n=== Build Complete ({}) ===", format_duration(outcome.total_duration()));
    println!("  Context:  {}", outcome.context);
    println!("  Base:     {}", outcome.base_version);
    println!("  k3s:      {}", outcome.runtime_version);
    if !outcome.skipped_operations.is_empty() {
        println!("  Skipped {} in-root operation(s) on the host", outcome.skipped_operations.len());
    }

    if !(request.package || request.validate) {
        if config.build.keep_build_root {
            println!("  Build root kept at {}", outcome.build_root.display());
        }
        outcome.finish();
        return Ok(());
    }

    let artifact = package::package(&outcome.build_root, &config)?;
    outcome.finish();

    if request.validate {
        let options = ValidateOptions {
            functional: request.functional,
            ..Default::default()
        };
        let report = validate(&artifact.path, &options)?;
        report.print();
        if !report.passed() {
            bail!("{} validation check(s) failed", report.failures().len());
        }
    }

    println!("\nTotal: {}", format_duration(build_start.elapsed()));
    Ok(())
}
