//! Package command - packages an existing build root.

use anyhow::Result;
use std::path::Path;

use super::load_config;
use rootsmith::package;

pub fn cmd_package(config_path: &Path, build_root: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let root = build_root.unwrap_or(&config.build.build_root);
    let artifact = package::package(root, &config)?;
    if artifact.low_compression {
        println!("  [WARN] compression ratio {:.2} is suspiciously low", artifact.compression_ratio);
    }
    Ok(())
}
