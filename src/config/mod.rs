//! Build configuration.
//!
//! A YAML (or JSON) document is merged field-by-field over a fixed table of
//! defaults and validated into an immutable [`BuildConfig`]. Only the four
//! identity fields are required:
//!
//! ```yaml
//! template:
//!   name: alpine-k3s
//!   version: 1.0.0
//!   base_image: alpine:3.18
//! runtime:
//!   version: v1.28.4+k3s1
//! ```
//!
//! Environment overrides never mutate a resolved config; they produce a new
//! one via [`BuildConfig::with_overrides`].

mod raw;
pub mod validate;

use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::common::hash::{sha256_bytes, DigestAlgorithm};
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use raw::RawConfig;

pub const DEFAULT_ARCHITECTURE: &str = "amd64";
pub const DEFAULT_CLUSTER_CIDR: &str = "10.42.0.0/16";
pub const DEFAULT_SERVICE_CIDR: &str = "10.43.0.0/16";
pub const DEFAULT_SERVICE_NAME: &str = "k3s";
pub const DEFAULT_MIRROR: &str = "https://dl-cdn.alpinelinux.org/alpine";
pub const DEFAULT_MIN_FREE_DISK_MB: u64 = 2048;
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 3;
pub const DEFAULT_FETCH_DELAY_SECS: u64 = 5;

const DEFAULT_DISABLED_COMPONENTS: &[&str] = &["traefik"];
const DEFAULT_PACKAGES: &[&str] = &["ca-certificates", "curl", "iptables", "ip6tables", "openrc"];
const DEFAULT_ALLOWED_SETUID: &[&str] = &["bin/su", "usr/bin/passwd"];
const DEFAULT_DNS_SERVERS: &[&str] = &["1.1.1.1", "8.8.8.8"];
const DEFAULT_INTERFACE: &str = "eth0";

/// Template identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateIdentity {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub description: String,
}

/// Base image: distribution plus a concrete version or a `major.minor` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseImageSpec {
    pub distribution: String,
    pub version_spec: String,
}

impl std::fmt::Display for BaseImageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.distribution, self.version_spec)
    }
}

/// Workload runtime (k3s) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    pub version: String,
    pub cluster_cidr: String,
    pub service_cidr: String,
    pub disable: Vec<String>,
    pub extra_args: Vec<String>,
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageLists {
    pub install: Vec<String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityPolicy {
    pub disable_root_login: bool,
    pub sysctl_hardening: bool,
    pub strip_setuid: bool,
    /// Root-relative paths that keep their setuid bit when stripping.
    pub allowed_setuid: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkPolicy {
    pub hostname: String,
    pub dns_servers: Vec<IpAddr>,
    pub interface: String,
    pub dhcp: bool,
}

/// Format of the filesystem image nested inside the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageFormat {
    TarGz,
    Squashfs,
}

impl ImageFormat {
    /// File name of the inner image inside the artifact.
    pub fn file_name(self) -> &'static str {
        match self {
            ImageFormat::TarGz => "rootfs.tar.gz",
            ImageFormat::Squashfs => "rootfs.squashfs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildOptions {
    pub build_root: PathBuf,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub checksums: Vec<DigestAlgorithm>,
    pub image_format: ImageFormat,
    pub min_free_disk_mb: u64,
    pub require_root: bool,
    pub keep_build_root: bool,
    pub mirror: String,
    pub fetch_attempts: u32,
    pub fetch_delay_secs: u64,
}

impl BuildOptions {
    /// Retry policy for cache downloads.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.fetch_attempts, Duration::from_secs(self.fetch_delay_secs))
    }
}

/// Fully resolved, immutable build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildConfig {
    pub template: TemplateIdentity,
    pub base_image: BaseImageSpec,
    pub runtime: RuntimeConfig,
    pub packages: PackageLists,
    pub security: SecurityPolicy,
    pub network: NetworkPolicy,
    pub build: BuildOptions,
}

/// Environment-sourced overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub build_root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub runtime_version: Option<String>,
    pub template_version: Option<String>,
}

impl Overrides {
    /// Collect `ROOTSMITH_*` overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        Self {
            build_root: vars.get("ROOTSMITH_BUILD_ROOT").map(PathBuf::from),
            output_dir: vars.get("ROOTSMITH_OUTPUT_DIR").map(PathBuf::from),
            cache_dir: vars.get("ROOTSMITH_CACHE_DIR").map(PathBuf::from),
            runtime_version: vars.get("ROOTSMITH_RUNTIME_VERSION").cloned(),
            template_version: vars.get("ROOTSMITH_TEMPLATE_VERSION").cloned(),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl BuildConfig {
    /// Return a new config with `overrides` applied. `self` is untouched.
    pub fn with_overrides(&self, overrides: &Overrides) -> Result<BuildConfig, ConfigError> {
        let mut next = self.clone();
        if let Some(path) = &overrides.build_root {
            next.build.build_root = absolute(path);
        }
        if let Some(path) = &overrides.output_dir {
            next.build.output_dir = absolute(path);
        }
        if let Some(path) = &overrides.cache_dir {
            next.build.cache_dir = absolute(path);
        }
        if let Some(version) = &overrides.runtime_version {
            validate::runtime_version("runtime.version", version)?;
            next.runtime.version = version.clone();
        }
        if let Some(version) = &overrides.template_version {
            validate::semantic_version("template.version", version)?;
            next.template.version = version.clone();
        }
        Ok(next)
    }

    /// File name of the packaged artifact.
    pub fn artifact_name(&self) -> String {
        format!(
            "{}-{}-{}.tar.gz",
            self.template.name, self.template.version, self.template.architecture
        )
    }

    /// Re-check every format constraint on an already-built value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate::template_name("template.name", &self.template.name)?;
        validate::semantic_version("template.version", &self.template.version)?;
        validate::architecture("template.architecture", &self.template.architecture)?;
        validate::base_image("template.base_image", &self.base_image.to_string())?;
        validate::runtime_version("runtime.version", &self.runtime.version)?;
        validate::cidr("runtime.cluster_cidr", &self.runtime.cluster_cidr)?;
        validate::cidr("runtime.service_cidr", &self.runtime.service_cidr)?;
        validate::hostname("runtime.service_name", &self.runtime.service_name)?;
        validate::hostname("network.hostname", &self.network.hostname)?;
        validate::hostname("network.interface", &self.network.interface)?;
        for pkg in &self.packages.install {
            validate::package_name("packages.install", pkg)?;
        }
        for pkg in &self.packages.remove {
            validate::package_name("packages.remove", pkg)?;
        }
        if self.build.checksums.is_empty() {
            return Err(ConfigError::InvalidFormat {
                field: "build.checksums",
                value: "[]".to_string(),
                expected: "at least one digest algorithm",
            });
        }
        validate::mirror_url("build.mirror", &self.build.mirror)
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!(
            "  template:   {} {} ({})",
            self.template.name, self.template.version, self.template.architecture
        );
        println!("  base image: {}", self.base_image);
        println!("  runtime:    k3s {}", self.runtime.version);
        println!("  packages:   +{} -{}", self.packages.install.len(), self.packages.remove.len());
        println!("  build root: {}", self.build.build_root.display());
        println!("  output:     {}", self.build.output_dir.display());
        println!("  cache:      {}", self.build.cache_dir.display());
    }
}

/// Where a configuration document comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A file on disk. Relative paths inside resolve against its directory.
    File(PathBuf),
    /// An in-memory document. Relative paths resolve against `base_dir`.
    Inline {
        name: String,
        text: String,
        base_dir: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SourceId {
    File {
        path: PathBuf,
        modified: Option<SystemTime>,
        len: u64,
    },
    Inline {
        name: String,
        digest: String,
    },
}

/// Resolves config sources into [`BuildConfig`] values, memoized by source
/// identity.
#[derive(Debug, Default)]
pub struct ConfigResolver {
    memo: HashMap<SourceId, Arc<BuildConfig>>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `source`, returning the memoized value when the source identity
    /// is unchanged.
    pub fn resolve(&mut self, source: &ConfigSource) -> Result<Arc<BuildConfig>, ConfigError> {
        let id = source_id(source)?;
        if let Some(config) = self.memo.get(&id) {
            debug!("config memo hit for {:?}", id);
            return Ok(Arc::clone(config));
        }

        let config = Arc::new(match source {
            ConfigSource::File(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                let base_dir = path.parent().unwrap_or(Path::new(""));
                resolve_str(&text, &path.display().to_string(), base_dir)?
            }
            ConfigSource::Inline {
                name,
                text,
                base_dir,
            } => resolve_str(text, name, base_dir)?,
        });

        self.memo.insert(id, Arc::clone(&config));
        Ok(config)
    }

    /// Forget every memoized config. The next `resolve` re-reads its source.
    pub fn reset(&mut self) {
        self.memo = HashMap::new();
    }

    /// Number of memoized configs.
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }
}

fn source_id(source: &ConfigSource) -> Result<SourceId, ConfigError> {
    match source {
        ConfigSource::File(path) => {
            let meta = fs::metadata(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            Ok(SourceId::File {
                path: path.canonicalize().unwrap_or_else(|_| path.clone()),
                modified: meta.modified().ok(),
                len: meta.len(),
            })
        }
        ConfigSource::Inline { name, text, base_dir } => Ok(SourceId::Inline {
            name: name.clone(),
            digest: sha256_bytes(format!("{}\0{}", base_dir.display(), text).as_bytes()),
        }),
    }
}

/// Parse and resolve a document. Pure apart from looking up the user cache
/// directory for the default `build.cache_dir`.
pub fn resolve_str(text: &str, source_name: &str, base_dir: &Path) -> Result<BuildConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
        source_name: source_name.to_string(),
        message: e.to_string(),
    })?;
    merge(raw, &absolute(base_dir))
}

/// `path` anchored at the working directory when relative. Mount tables
/// list absolute paths, so every configured directory must be one.
pub fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) if path.as_os_str().is_empty() => cwd,
        Ok(cwd) => cwd.join(path),
        Err(e) => {
            warn!("working directory unavailable, keeping {} relative: {}", path.display(), e);
            path.to_path_buf()
        }
    }
}

struct Sections {
    template: raw::RawTemplate,
    runtime: raw::RawRuntime,
    packages: raw::RawPackages,
    security: raw::RawSecurity,
    network: raw::RawNetwork,
    build: raw::RawBuild,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::MissingField { field }),
    }
}

fn strings(defaults: &[&str]) -> Vec<String> {
    defaults.iter().map(|s| s.to_string()).collect()
}

fn resolve_path(base_dir: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

fn default_cache_dir(base_dir: &Path) -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("rootsmith"))
        .unwrap_or_else(|| base_dir.join(".cache/rootsmith"))
}

fn merge(raw: RawConfig, base_dir: &Path) -> Result<BuildConfig, ConfigError> {
    let raw = Sections {
        template: raw.template.unwrap_or_default(),
        runtime: raw.runtime.unwrap_or_default(),
        packages: raw.packages.unwrap_or_default(),
        security: raw.security.unwrap_or_default(),
        network: raw.network.unwrap_or_default(),
        build: raw.build.unwrap_or_default(),
    };

    // Required identity fields first so their absence is reported before
    // any format problem elsewhere.
    let name = required(raw.template.name, "template.name")?;
    let version = required(raw.template.version, "template.version")?;
    let base_image = required(raw.template.base_image, "template.base_image")?;
    let runtime_version = required(raw.runtime.version, "runtime.version")?;

    validate::template_name("template.name", &name)?;
    validate::semantic_version("template.version", &version)?;
    let (distribution, version_spec) = validate::base_image("template.base_image", &base_image)?;
    validate::runtime_version("runtime.version", &runtime_version)?;

    let architecture = raw
        .template
        .architecture
        .unwrap_or_else(|| DEFAULT_ARCHITECTURE.to_string());
    validate::architecture("template.architecture", &architecture)?;

    let description = raw
        .template
        .description
        .unwrap_or_else(|| format!("{name} template"));

    let cluster_cidr = raw
        .runtime
        .cluster_cidr
        .unwrap_or_else(|| DEFAULT_CLUSTER_CIDR.to_string());
    validate::cidr("runtime.cluster_cidr", &cluster_cidr)?;
    let service_cidr = raw
        .runtime
        .service_cidr
        .unwrap_or_else(|| DEFAULT_SERVICE_CIDR.to_string());
    validate::cidr("runtime.service_cidr", &service_cidr)?;
    let service_name = raw
        .runtime
        .service_name
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    validate::hostname("runtime.service_name", &service_name)?;

    let install = raw.packages.install.unwrap_or_else(|| strings(DEFAULT_PACKAGES));
    for pkg in &install {
        validate::package_name("packages.install", pkg)?;
    }
    let remove = raw.packages.remove.unwrap_or_default();
    for pkg in &remove {
        validate::package_name("packages.remove", pkg)?;
    }

    let hostname = raw.network.hostname.unwrap_or_else(|| name.clone());
    validate::hostname("network.hostname", &hostname)?;
    let interface = raw
        .network
        .interface
        .unwrap_or_else(|| DEFAULT_INTERFACE.to_string());
    validate::hostname("network.interface", &interface)?;
    let dns_servers = raw
        .network
        .dns_servers
        .unwrap_or_else(|| strings(DEFAULT_DNS_SERVERS))
        .iter()
        .map(|s| {
            s.parse::<IpAddr>().map_err(|_| ConfigError::InvalidFormat {
                field: "network.dns_servers",
                value: s.clone(),
                expected: "IP address",
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut checksums = Vec::new();
    for algorithm_name in raw
        .build
        .checksums
        .unwrap_or_else(|| vec![DigestAlgorithm::Sha256.name().to_string()])
    {
        let algorithm = algorithm_name
            .parse::<DigestAlgorithm>()
            .map_err(|_| ConfigError::InvalidFormat {
                field: "build.checksums",
                value: algorithm_name.clone(),
                expected: "one of sha256, sha512",
            })?;
        if !checksums.contains(&algorithm) {
            checksums.push(algorithm);
        }
    }
    if checksums.is_empty() {
        return Err(ConfigError::InvalidFormat {
            field: "build.checksums",
            value: "[]".to_string(),
            expected: "at least one digest algorithm",
        });
    }

    let image_format = match raw.build.image_format.as_deref() {
        None | Some("tar-gz") => ImageFormat::TarGz,
        Some("squashfs") => ImageFormat::Squashfs,
        Some(other) => {
            return Err(ConfigError::InvalidFormat {
                field: "build.image_format",
                value: other.to_string(),
                expected: "tar-gz or squashfs",
            })
        }
    };

    let mirror = raw
        .build
        .mirror
        .unwrap_or_else(|| DEFAULT_MIRROR.to_string())
        .trim_end_matches('/')
        .to_string();
    validate::mirror_url("build.mirror", &mirror)?;

    let fetch_attempts = raw.build.fetch_attempts.unwrap_or(DEFAULT_FETCH_ATTEMPTS);
    if fetch_attempts == 0 {
        return Err(ConfigError::InvalidFormat {
            field: "build.fetch_attempts",
            value: "0".to_string(),
            expected: "at least 1",
        });
    }

    let build = BuildOptions {
        build_root: resolve_path(base_dir, raw.build.build_root.as_deref().unwrap_or("build/rootfs")),
        output_dir: resolve_path(base_dir, raw.build.output_dir.as_deref().unwrap_or("output")),
        cache_dir: raw
            .build
            .cache_dir
            .as_deref()
            .map(|p| resolve_path(base_dir, p))
            .unwrap_or_else(|| default_cache_dir(base_dir)),
        checksums,
        image_format,
        min_free_disk_mb: raw.build.min_free_disk_mb.unwrap_or(DEFAULT_MIN_FREE_DISK_MB),
        require_root: raw.build.require_root.unwrap_or(true),
        keep_build_root: raw.build.keep_build_root.unwrap_or(false),
        mirror,
        fetch_attempts,
        fetch_delay_secs: raw.build.fetch_delay_secs.unwrap_or(DEFAULT_FETCH_DELAY_SECS),
    };

    Ok(BuildConfig {
        template: TemplateIdentity {
            name,
            version,
            architecture,
            description,
        },
        base_image: BaseImageSpec {
            distribution,
            version_spec,
        },
        runtime: RuntimeConfig {
            version: runtime_version,
            cluster_cidr,
            service_cidr,
            disable: raw
                .runtime
                .disable
                .unwrap_or_else(|| strings(DEFAULT_DISABLED_COMPONENTS)),
            extra_args: raw.runtime.extra_args.unwrap_or_default(),
            service_name,
        },
        packages: PackageLists { install, remove },
        security: SecurityPolicy {
            disable_root_login: raw.security.disable_root_login.unwrap_or(true),
            sysctl_hardening: raw.security.sysctl_hardening.unwrap_or(true),
            strip_setuid: raw.security.strip_setuid.unwrap_or(false),
            allowed_setuid: raw
                .security
                .allowed_setuid
                .unwrap_or_else(|| strings(DEFAULT_ALLOWED_SETUID)),
        },
        network: NetworkPolicy {
            hostname,
            dns_servers,
            interface,
            dhcp: raw.network.dhcp.unwrap_or(true),
        },
        build,
    })
}
