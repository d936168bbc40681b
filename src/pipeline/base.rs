//! Base image: resolve, fetch, unpack.

use tracing::info;

use super::{BuildState, Stage, SKELETON_DIRS};
use crate::cache::FetchRequest;
use crate::common::unpack_tar_gz;
use crate::error::{BuildError, StageError};
use crate::exec::{ExecutionContext, Executor};

/// Distribution name of the runtime binary in the cache.
pub const RUNTIME_DISTRIBUTION: &str = "k3s";

pub(super) fn fetch_base_image(state: &mut BuildState<'_>) -> Result<(), BuildError> {
    let config = state.config;
    let arch = &config.template.architecture;
    let base = &config.base_image;

    let version = state.cache.resolve_version(&base.distribution, &base.version_spec, arch)?;
    println!("  Base image: {}:{} ({})", base.distribution, version, arch);

    let requests = [
        FetchRequest::new(&base.distribution, &version, arch),
        FetchRequest::new(RUNTIME_DISTRIBUTION, &config.runtime.version, arch),
    ];
    let mut entries = state.cache.fetch_many(&requests)?.into_iter();
    let (Some(image), Some(runtime)) = (entries.next(), entries.next()) else {
        return Err(StageError::OutOfOrder {
            stage: Stage::FetchBaseImage.name(),
            missing: "both cache entries",
        }
        .into());
    };

    info!("base image {} ({} bytes)", image.path.display(), image.size);
    info!("runtime binary {} ({} bytes)", runtime.path.display(), runtime.size);
    state.base_version = Some(version);
    state.base_image = Some(image);
    state.runtime_binary = Some(runtime);
    Ok(())
}

pub(super) fn extract_base_image(state: &mut BuildState<'_>) -> Result<(), StageError> {
    let image = state.base_image.as_ref().ok_or(StageError::OutOfOrder {
        stage: Stage::ExtractBaseImage.name(),
        missing: "the base image",
    })?;
    let root = state.root().to_path_buf();

    println!("  Extracting {}...", image.path.display());
    unpack_tar_gz(&image.path, &root).map_err(|e| StageError::Archive {
        path: image.path.clone(),
        message: e.to_string(),
    })?;

    let missing: Vec<String> = SKELETON_DIRS
        .iter()
        .filter(|dir| !root.join(dir).is_dir())
        .map(|dir| dir.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(StageError::MissingSkeleton { root, missing });
    }

    let context = ExecutionContext::detect(&root, state.probe);
    println!("  Execution context: {}", context);
    let executor = Executor::new(context, &root, state.runner.clone());
    if let Some(guard) = state.guard.as_mut() {
        guard.track_mounts(executor.mount_table(), executor.runner());
    }
    if context == ExecutionContext::Isolated {
        executor.prepare_isolation()?;
    }
    state.executor = Some(executor);
    Ok(())
}
