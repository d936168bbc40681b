//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Run the build pipeline, optionally package and validate
//! - `package` - Package an existing build root
//! - `validate` - Validate a packaged artifact
//! - `cache` - Cache maintenance
//! - `preflight` - Run preflight checks
//! - `show` - Display the resolved configuration

pub mod build;
pub mod cache;
pub mod package;
mod preflight;
pub mod show;
pub mod validate;

pub use build::cmd_build;
pub use cache::cmd_cache_evict;
pub use package::cmd_package;
pub use preflight::cmd_preflight;
pub use show::cmd_show_config;
pub use validate::cmd_validate;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use rootsmith::{BuildConfig, ConfigResolver, ConfigSource, Overrides};

/// Resolve the config file and apply `ROOTSMITH_*` overrides from the
/// environment (including a loaded `.env`).
pub fn load_config(path: &Path) -> Result<Arc<BuildConfig>> {
    let mut resolver = ConfigResolver::new();
    let config = resolver
        .resolve(&ConfigSource::File(path.to_path_buf()))
        .with_context(|| format!("loading {}", path.display()))?;
    let overrides = Overrides::from_env();
    if overrides.is_empty() {
        return Ok(config);
    }
    let overridden = config
        .with_overrides(&overrides)
        .context("applying ROOTSMITH_* overrides")?;
    Ok(Arc::new(overridden))
}
