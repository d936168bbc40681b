//! Cache command - maintenance of the image cache.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use super::load_config;
use rootsmith::cache::{CurlTransport, ImageCache};

/// Evict entries older than `max_age_days`, then oldest-first down to `max_size_mb`.
pub fn cmd_cache_evict(config_path: &Path, max_age_days: Option<u64>, max_size_mb: Option<u64>) -> Result<()> {
    let config = load_config(config_path)?;
    let cache = ImageCache::from_config(&config, Arc::new(CurlTransport::default()))?;

    println!("Evicting from {}...", cache.root().display());
    let report = cache.evict(max_age_days, max_size_mb.map(|mb| mb * 1024 * 1024))?;
    for key in &report.removed {
        println!("  removed {}", key);
    }
    println!(
        "Freed {} MB, {} MB remain",
        report.freed_bytes / 1024 / 1024,
        report.remaining_bytes / 1024 / 1024
    );
    Ok(())
}
