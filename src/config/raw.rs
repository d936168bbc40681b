//! Document shape as written by users. Every field is optional here; the
//! resolver merges present values over the defaults table. Sections are
//! optional too, so an empty `runtime:` key reads as "not given".

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub template: Option<RawTemplate>,
    pub runtime: Option<RawRuntime>,
    pub packages: Option<RawPackages>,
    pub security: Option<RawSecurity>,
    pub network: Option<RawNetwork>,
    pub build: Option<RawBuild>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTemplate {
    pub name: Option<String>,
    pub version: Option<String>,
    pub architecture: Option<String>,
    pub description: Option<String>,
    pub base_image: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRuntime {
    pub version: Option<String>,
    pub cluster_cidr: Option<String>,
    pub service_cidr: Option<String>,
    pub disable: Option<Vec<String>>,
    pub extra_args: Option<Vec<String>>,
    pub service_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPackages {
    pub install: Option<Vec<String>>,
    pub remove: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSecurity {
    pub disable_root_login: Option<bool>,
    pub sysctl_hardening: Option<bool>,
    pub strip_setuid: Option<bool>,
    pub allowed_setuid: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawNetwork {
    pub hostname: Option<String>,
    pub dns_servers: Option<Vec<String>>,
    pub interface: Option<String>,
    pub dhcp: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBuild {
    pub build_root: Option<String>,
    pub output_dir: Option<String>,
    pub cache_dir: Option<String>,
    pub checksums: Option<Vec<String>>,
    pub image_format: Option<String>,
    pub min_free_disk_mb: Option<u64>,
    pub require_root: Option<bool>,
    pub keep_build_root: Option<bool>,
    pub mirror: Option<String>,
    pub fetch_attempts: Option<u32>,
    pub fetch_delay_secs: Option<u64>,
}
