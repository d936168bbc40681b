//! Turn a finished build root into a distributable artifact.
//!
//! ```text
//! <output>/<name>-<version>-<arch>.tar.gz
//! ├── rootfs.tar.gz | rootfs.squashfs
//! ├── metadata.yaml
//! ├── manifest.json
//! └── README.md
//! <output>/<name>-<version>-<arch>.tar.gz.sha256   (one per algorithm)
//! ```

mod manifest;

pub use manifest::{
    readme, ImageMetadata, Manifest, ManifestImage, ManifestPackages, MetadataProperties, MANIFEST_FILE,
    METADATA_FILE, README_FILE, REQUIRED_FIELDS,
};

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::common::hash::{hash_file, DigestAlgorithm};
use crate::common::{cleanup_work_dir, pack_members, pack_tree, prepare_work_dir, tree_stats};
use crate::config::{BuildConfig, ImageFormat};
use crate::error::PackagingError;
use crate::exec::{CommandRunner, SystemRunner};
use crate::process::Cmd;
use crate::timing::Timer;

/// Unpacked/packed below this means the inner image probably holds
/// already-compressed or random data.
pub const MIN_PLAUSIBLE_RATIO: f64 = 1.5;

/// Members of the outer archive, in archive order; the first is the inner
/// image name for the configured format.
pub fn member_names(format: ImageFormat) -> [&'static str; 4] {
    [format.file_name(), METADATA_FILE, MANIFEST_FILE, README_FILE]
}

/// A packaged template.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
    pub checksums: Vec<(DigestAlgorithm, PathBuf)>,
    pub manifest: Manifest,
    /// Regular-file bytes in the build root.
    pub unpacked_bytes: u64,
    pub compression_ratio: f64,
    pub low_compression: bool,
}

/// Removes the staging directory however packaging ends.
struct Staging(PathBuf);

impl Drop for Staging {
    fn drop(&mut self) {
        cleanup_work_dir(&self.0);
    }
}

/// Package `build_root` with the system command runner.
pub fn package(build_root: &Path, config: &BuildConfig) -> Result<Artifact, PackagingError> {
    package_with(build_root, config, &SystemRunner)
}

pub fn package_with(
    build_root: &Path,
    config: &BuildConfig,
    runner: &dyn CommandRunner,
) -> Result<Artifact, PackagingError> {
    if !build_root.is_dir() {
        return Err(PackagingError::MissingBuildRoot(build_root.to_path_buf()));
    }
    let timer = Timer::start("package");
    let output = &config.build.output_dir;
    let artifact_name = config.artifact_name();
    let staging_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PackagingError::Staging { path, source }
    };

    fs::create_dir_all(output).map_err(staging_err(output))?;
    let staging_name = format!(".staging-{}", config.template.name);
    let staging = Staging(prepare_work_dir(output, &staging_name).map_err(staging_err(&output.join(&staging_name)))?);
    let dir = staging.0.as_path();

    println!("Packaging {}...", artifact_name);

    // Inner image
    let format = config.build.image_format;
    let inner = dir.join(format.file_name());
    let stats = tree_stats(build_root).map_err(staging_err(build_root))?;
    match format {
        ImageFormat::TarGz => {
            pack_tree(build_root, &inner).map_err(|e| PackagingError::Compression {
                path: inner.clone(),
                message: e.to_string(),
            })?;
        }
        ImageFormat::Squashfs => {
            let cmd = Cmd::new("mksquashfs")
                .arg_path(build_root)
                .arg_path(&inner)
                .args(["-comp", "gzip", "-noappend", "-no-xattrs", "-all-root"])
                .error_msg("mksquashfs failed (is squashfs-tools installed?)");
            runner.run(cmd).map_err(|e| PackagingError::Compression {
                path: inner.clone(),
                message: e.to_string(),
            })?;
        }
    }
    let inner_size = fs::metadata(&inner).map_err(staging_err(&inner))?.len();
    let inner_sha256 = hash_file(&inner, DigestAlgorithm::Sha256).map_err(staging_err(&inner))?;
    println!("  Inner image: {} ({} bytes)", format.file_name(), inner_size);

    // Descriptors
    let built_at = Utc::now();
    let release = base_release(build_root, config);
    let manifest = Manifest::new(
        config,
        &release,
        built_at,
        ManifestImage {
            file: format.file_name().to_string(),
            sha256: inner_sha256,
            size: inner_size,
        },
    );
    let metadata = ImageMetadata::new(config, &release, built_at);

    let manifest_json = serde_json::to_string_pretty(&manifest).map_err(|e| PackagingError::Serialize {
        what: MANIFEST_FILE,
        message: e.to_string(),
    })?;
    let metadata_yaml = serde_yaml::to_string(&metadata).map_err(|e| PackagingError::Serialize {
        what: METADATA_FILE,
        message: e.to_string(),
    })?;
    for (name, content) in [
        (MANIFEST_FILE, manifest_json + "\n"),
        (METADATA_FILE, metadata_yaml),
        (README_FILE, readme(&manifest, &metadata)),
    ] {
        let path = dir.join(name);
        fs::write(&path, content).map_err(staging_err(&path))?;
    }

    // Outer archive
    let archive = output.join(&artifact_name);
    let members = member_names(format);
    pack_members(dir, &members, &archive).map_err(|e| PackagingError::Compression {
        path: archive.clone(),
        message: e.to_string(),
    })?;
    let size = fs::metadata(&archive).map_err(staging_err(&archive))?.len();

    let checksums = write_checksums(&archive, &config.build.checksums)?;

    let compression_ratio = if inner_size == 0 {
        0.0
    } else {
        stats.bytes as f64 / inner_size as f64
    };
    let low_compression = compression_ratio < MIN_PLAUSIBLE_RATIO;
    if low_compression {
        warn!(
            "compression ratio {:.2} is below {:.1}; the image may contain pre-compressed data",
            compression_ratio, MIN_PLAUSIBLE_RATIO
        );
    }

    println!("  Artifact: {} ({} bytes, ratio {:.2})", archive.display(), size, compression_ratio);
    for (algorithm, path) in &checksums {
        println!("  {}: {}", algorithm.name(), path.display());
    }
    timer.finish();
    info!("packaged {} files into {}", stats.files, archive.display());

    drop(staging);
    Ok(Artifact {
        path: archive,
        size,
        checksums,
        manifest,
        unpacked_bytes: stats.bytes,
        compression_ratio,
        low_compression,
    })
}

/// `<archive>.<algorithm>` in `sha256sum` format, one per algorithm.
pub fn write_checksums(
    archive: &Path,
    algorithms: &[DigestAlgorithm],
) -> Result<Vec<(DigestAlgorithm, PathBuf)>, PackagingError> {
    let file_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut written = Vec::with_capacity(algorithms.len());
    for &algorithm in algorithms {
        let digest = hash_file(archive, algorithm).map_err(|source| PackagingError::Staging {
            path: archive.to_path_buf(),
            source,
        })?;
        let path = checksum_path(archive, algorithm);
        fs::write(&path, format!("{digest}  {file_name}\n"))
            .map_err(|source| PackagingError::Staging { path: path.clone(), source })?;
        written.push((algorithm, path));
    }
    Ok(written)
}

pub fn checksum_path(archive: &Path, algorithm: DigestAlgorithm) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".");
    name.push(algorithm.name());
    PathBuf::from(name)
}

/// Release recorded by the base image itself, else the configured spec.
fn base_release(build_root: &Path, config: &BuildConfig) -> String {
    fs::read_to_string(build_root.join("etc/alpine-release"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| config.base_image.version_spec.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::archive::list_tar_gz;
    use crate::config::resolve_str;
    use tempfile::TempDir;

    fn config(base: &Path) -> BuildConfig {
        let text = "\
template:
  name: edge
  version: 1.2.0
  base_image: alpine:3.18
runtime:
  version: v1.28.4+k3s1
build:
  output_dir: out
  checksums: [sha256, sha512]
";
        resolve_str(text, "test.yaml", base).unwrap()
    }

    fn tree(root: &Path) {
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/alpine-release"), "3.18.4\n").unwrap();
        fs::write(root.join("etc/motd"), "welcome\n".repeat(500)).unwrap();
    }

    #[test]
    fn test_package_writes_members_and_checksums() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        tree(&root);
        let config = config(temp.path());

        let artifact = package(&root, &config).unwrap();
        assert_eq!(artifact.path, temp.path().join("out/edge-1.2.0-amd64.tar.gz"));
        assert_eq!(
            list_tar_gz(&artifact.path).unwrap(),
            vec!["rootfs.tar.gz", "metadata.yaml", "manifest.json", "README.md"]
        );
        assert_eq!(artifact.checksums.len(), 2);
        let line = fs::read_to_string(&artifact.checksums[0].1).unwrap();
        assert!(line.ends_with("  edge-1.2.0-amd64.tar.gz\n"));
        assert_eq!(artifact.manifest.base_image, "alpine:3.18.4");
        assert!(!artifact.low_compression);
        assert!(!temp.path().join("out/.staging-edge").exists());
    }

    #[test]
    fn test_missing_build_root_is_an_error() {
        let temp = TempDir::new().unwrap();
        let err = package(&temp.path().join("nope"), &config(temp.path())).unwrap_err();
        assert!(matches!(err, PackagingError::MissingBuildRoot(_)));
    }

    #[test]
    fn test_staging_removed_on_failure() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        tree(&root);
        let config = config(temp.path());
        // A directory where the archive should go makes the final write fail.
        fs::create_dir_all(temp.path().join("out/edge-1.2.0-amd64.tar.gz")).unwrap();

        assert!(package(&root, &config).is_err());
        assert!(!temp.path().join("out/.staging-edge").exists());
    }
}
