//! Show command - displays the resolved configuration.

use anyhow::Result;
use std::path::Path;

use super::load_config;

pub fn cmd_show_config(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    config.print();
    println!("  artifact:   {}", config.build.output_dir.join(config.artifact_name()).display());
    Ok(())
}
