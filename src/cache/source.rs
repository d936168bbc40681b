//! Where each distribution's artifacts live upstream.

use regex::Regex;
use tracing::warn;

use super::version;

/// Alpine publishes minirootfs tarballs under its own arch names.
const ALPINE_ARCH: &[(&str, &str)] = &[
    ("amd64", "x86_64"),
    ("x86_64", "x86_64"),
    ("arm64", "aarch64"),
    ("aarch64", "aarch64"),
    ("armhf", "armhf"),
    ("armv7", "armv7"),
];

/// k3s release binaries carry a per-arch suffix; amd64 has none.
const K3S_SUFFIX: &[(&str, &str)] = &[
    ("amd64", ""),
    ("x86_64", ""),
    ("arm64", "-arm64"),
    ("aarch64", "-arm64"),
    ("armhf", "-armhf"),
];

/// k3s digest files are named after the Go arch.
const K3S_DIGEST_ARCH: &[(&str, &str)] = &[
    ("amd64", "amd64"),
    ("x86_64", "amd64"),
    ("arm64", "arm64"),
    ("aarch64", "arm64"),
    ("armhf", "arm"),
];

pub const K3S_RELEASES: &str = "https://github.com/k3s-io/k3s/releases/download";

/// Pure table lookup. Unmapped names pass through unchanged.
pub fn lookup_arch(table: &[(&str, &str)], distribution: &str, arch: &str) -> String {
    match table.iter().find(|(from, _)| *from == arch) {
        Some((_, to)) => to.to_string(),
        None => {
            warn!("no {} mapping for architecture '{}', using it as-is", distribution, arch);
            arch.to_string()
        }
    }
}

/// A distribution the cache knows how to download.
pub trait ArtifactSource: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `spec` names exactly one release.
    fn is_concrete(&self, spec: &str) -> bool;

    /// File name under the cache entry directory.
    fn file_name(&self, version: &str, arch: &str) -> String;

    fn artifact_url(&self, version: &str, arch: &str) -> String;

    /// URL of the published digest list, if the distribution publishes one.
    fn digest_url(&self, version: &str, arch: &str) -> Option<String>;

    /// URL of a listing that enumerates releases under a `major.minor` prefix.
    fn index_url(&self, prefix: &str, arch: &str) -> Option<String>;

    /// Concrete versions found in an index document.
    fn parse_index(&self, text: &str, arch: &str) -> Vec<String>;
}

/// Find the digest for `file_name` in `sha256sum`-style text.
///
/// A document holding a single bare digest is accepted as-is.
pub fn parse_digest(text: &str, file_name: &str) -> Option<String> {
    let is_digest = |s: &str| s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit());
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    for line in &lines {
        let mut parts = line.split_whitespace();
        if let (Some(digest), Some(name)) = (parts.next(), parts.next()) {
            let name = name.trim_start_matches('*');
            let base = name.rsplit('/').next().unwrap_or(name);
            if base == file_name && is_digest(digest) {
                return Some(digest.to_ascii_lowercase());
            }
        }
    }

    match lines.as_slice() {
        [only] if is_digest(only) => Some(only.to_ascii_lowercase()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Alpine {
    mirror: String,
}

impl Alpine {
    pub fn new(mirror: &str) -> Self {
        Self {
            mirror: mirror.trim_end_matches('/').to_string(),
        }
    }

    fn arch(&self, arch: &str) -> String {
        lookup_arch(ALPINE_ARCH, "alpine", arch)
    }

    fn release_dir(&self, minor: &str, arch: &str) -> String {
        format!("{}/v{}/releases/{}", self.mirror, minor, self.arch(arch))
    }
}

impl ArtifactSource for Alpine {
    fn name(&self) -> &str {
        "alpine"
    }

    fn is_concrete(&self, spec: &str) -> bool {
        version::is_full_version(spec)
    }

    fn file_name(&self, version: &str, arch: &str) -> String {
        format!("alpine-minirootfs-{}-{}.tar.gz", version, self.arch(arch))
    }

    fn artifact_url(&self, version: &str, arch: &str) -> String {
        format!(
            "{}/{}",
            self.release_dir(&version::major_minor(version), arch),
            self.file_name(version, arch)
        )
    }

    fn digest_url(&self, version: &str, arch: &str) -> Option<String> {
        Some(format!("{}.sha256", self.artifact_url(version, arch)))
    }

    fn index_url(&self, prefix: &str, arch: &str) -> Option<String> {
        Some(format!("{}/", self.release_dir(prefix, arch)))
    }

    fn parse_index(&self, text: &str, arch: &str) -> Vec<String> {
        let pattern = format!(
            r"alpine-minirootfs-(\d+\.\d+\.\d+)-{}\.tar\.gz",
            regex::escape(&self.arch(arch))
        );
        let Ok(re) = Regex::new(&pattern) else {
            return Vec::new();
        };
        let mut found: Vec<String> = re.captures_iter(text).map(|c| c[1].to_string()).collect();
        found.sort();
        found.dedup();
        found
    }
}

#[derive(Debug, Clone)]
pub struct K3s {
    releases: String,
}

impl Default for K3s {
    fn default() -> Self {
        Self::new(K3S_RELEASES)
    }
}

impl K3s {
    pub fn new(releases: &str) -> Self {
        Self {
            releases: releases.trim_end_matches('/').to_string(),
        }
    }

    fn release_dir(&self, version: &str) -> String {
        // Release tags contain '+', which must be escaped in the path.
        format!("{}/{}", self.releases, version.replace('+', "%2B"))
    }
}

impl ArtifactSource for K3s {
    fn name(&self) -> &str {
        "k3s"
    }

    fn is_concrete(&self, spec: &str) -> bool {
        spec.starts_with('v') && version::is_full_version(spec[1..].split('+').next().unwrap_or(""))
    }

    fn file_name(&self, _version: &str, arch: &str) -> String {
        format!("k3s{}", lookup_arch(K3S_SUFFIX, "k3s", arch))
    }

    fn artifact_url(&self, version: &str, arch: &str) -> String {
        format!("{}/{}", self.release_dir(version), self.file_name(version, arch))
    }

    fn digest_url(&self, version: &str, arch: &str) -> Option<String> {
        Some(format!(
            "{}/sha256sum-{}.txt",
            self.release_dir(version),
            lookup_arch(K3S_DIGEST_ARCH, "k3s", arch)
        ))
    }

    fn index_url(&self, _prefix: &str, _arch: &str) -> Option<String> {
        None
    }

    fn parse_index(&self, _text: &str, _arch: &str) -> Vec<String> {
        Vec::new()
    }
}
