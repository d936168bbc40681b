//! Descriptors shipped inside an artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BuildConfig;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const METADATA_FILE: &str = "metadata.yaml";
pub const README_FILE: &str = "README.md";

/// Identity fields a manifest must carry, non-empty.
pub const REQUIRED_FIELDS: &[&str] = &["name", "version", "architecture", "runtime_version", "build_timestamp"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub runtime_version: String,
    pub build_timestamp: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub packages: ManifestPackages,
    #[serde(default)]
    pub image: ManifestImage,
    #[serde(default)]
    pub builder: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPackages {
    pub install: Vec<String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestImage {
    pub file: String,
    pub sha256: String,
    pub size: u64,
}

impl Manifest {
    pub fn new(config: &BuildConfig, base_release: &str, built_at: DateTime<Utc>, image: ManifestImage) -> Self {
        Self {
            name: config.template.name.clone(),
            version: config.template.version.clone(),
            architecture: config.template.architecture.clone(),
            runtime_version: config.runtime.version.clone(),
            build_timestamp: built_at.to_rfc3339(),
            description: config.template.description.clone(),
            base_image: format!("{}:{}", config.base_image.distribution, base_release),
            packages: ManifestPackages {
                install: config.packages.install.clone(),
                remove: config.packages.remove.clone(),
            },
            image,
            builder: format!("rootsmith {}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let values = [
            &self.name,
            &self.version,
            &self.architecture,
            &self.runtime_version,
            &self.build_timestamp,
        ];
        REQUIRED_FIELDS
            .iter()
            .zip(values)
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(field, _)| *field)
            .collect()
    }
}

/// Instantiation descriptor read by whatever boots the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub architecture: String,
    pub creation_date: i64,
    pub properties: MetadataProperties,
    pub entrypoint: String,
    pub image: String,
    pub runtime_service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataProperties {
    pub os: String,
    pub release: String,
    pub description: String,
}

impl ImageMetadata {
    pub fn new(config: &BuildConfig, base_release: &str, built_at: DateTime<Utc>) -> Self {
        Self {
            architecture: config.template.architecture.clone(),
            creation_date: built_at.timestamp(),
            properties: MetadataProperties {
                os: config.base_image.distribution.clone(),
                release: base_release.to_string(),
                description: config.template.description.clone(),
            },
            entrypoint: "/sbin/init".to_string(),
            image: config.build.image_format.file_name().to_string(),
            runtime_service: config.runtime.service_name.clone(),
        }
    }
}

pub fn readme(manifest: &Manifest, metadata: &ImageMetadata) -> String {
    format!(
        "# {name} {version}\n\n\
         {description}\n\n\
         - Architecture: {arch}\n\
         - Base image: {base}\n\
         - k3s: {runtime}\n\
         - Built: {built}\n\n\
         ## Usage\n\n\
         Unpack `{image}` as the root filesystem of a container or VM and boot\n\
         `{entrypoint}`. OpenRC starts the `{service}` service, which runs\n\
         `k3s server` with `/etc/rancher/k3s/config.yaml`.\n\n\
         Verify the download first:\n\n\
         ```sh\n\
         sha256sum -c {name}-{version}-{arch}.tar.gz.sha256\n\
         ```\n",
        name = manifest.name,
        version = manifest.version,
        description = manifest.description,
        arch = manifest.architecture,
        base = manifest.base_image,
        runtime = manifest.runtime_version,
        built = manifest.build_timestamp,
        image = metadata.image,
        entrypoint = metadata.entrypoint,
        service = metadata.runtime_service,
    )
}
