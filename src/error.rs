//! Error taxonomy for the template build.
//!
//! Each component owns one error enum. [`BuildError`] unifies them for the
//! binary, which maps every variant to a process exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes returned by the `rootsmith` binary.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const BAD_ARGUMENTS: i32 = 2;
    pub const BAD_CONFIG: i32 = 3;
    pub const NETWORK: i32 = 4;
    pub const PERMISSION: i32 = 5;
    pub const RESOURCES: i32 = 6;
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("invalid value '{value}' for '{field}': expected {expected}")]
    InvalidFormat {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("failed to parse {source_name}: {message}")]
    Parse { source_name: String, message: String },

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("download of {url} failed after {attempts} attempts: {last_error}")]
    NetworkExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("checksum mismatch for {path}\n  expected: {expected}\n  actual:   {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("unknown distribution '{0}' (known: alpine, k3s)")]
    UnknownDistribution(String),

    #[error("invalid version specifier '{spec}' for {distribution}")]
    InvalidVersionSpec { distribution: String, spec: String },

    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("insufficient privilege: {reason}")]
    InsufficientPrivilege { reason: String },

    #[error("insufficient disk space at {path}: {available_mb} MB free, {required_mb} MB required")]
    InsufficientDiskSpace {
        path: PathBuf,
        available_mb: u64,
        required_mb: u64,
    },

    #[error("missing capability '{capability}': {hint}")]
    MissingCapability { capability: String, hint: String },

    #[error("build root {path} is in use by another run{}", .holder.map(|p| format!(" (PID {p})")).unwrap_or_default())]
    BuildRootLocked { path: PathBuf, holder: Option<u32> },

    #[error("preflight failed: {failed} check(s) failed ({summary})")]
    Preflight { failed: usize, summary: String },
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("base image extraction in {root} is missing core directories: {}", .missing.join(", "))]
    MissingSkeleton { root: PathBuf, missing: Vec<String> },

    #[error("build root {root} is missing critical paths: {}", .missing.join(", "))]
    MissingCriticalPaths { root: PathBuf, missing: Vec<String> },

    #[error("runtime version mismatch: configured {expected}, installed binary reports {actual}")]
    RuntimeVersionMismatch { expected: String, actual: String },

    #[error("command failed: {command}\n{detail}")]
    Command { command: String, detail: String },

    #[error("{root} still has mounts that could not be released: {mounts:?}")]
    StillMounted { root: PathBuf, mounts: Vec<PathBuf> },

    #[error("archive error for {path}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not render {what}: {message}")]
    Render { what: &'static str, message: String },

    #[error("{stage} ran before {missing} was available")]
    OutOfOrder {
        stage: &'static str,
        missing: &'static str,
    },

    #[error("build cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("build root {0} does not exist")]
    MissingBuildRoot(PathBuf),

    #[error("staging failed at {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("compression failed for {path}: {message}")]
    Compression { path: PathBuf, message: String },

    #[error("failed to serialize {what}: {message}")]
    Serialize { what: &'static str, message: String },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("artifact not found: {0}")]
    ArtifactNotFound(PathBuf),

    #[error("could not prepare scratch space: {0}")]
    Scratch(#[source] std::io::Error),
}

/// Any failure surfaced by the pipeline, packager, validator or cache.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    #[error("packaging error: {0}")]
    Packaging(#[from] PackagingError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl FetchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FetchError::Io { .. } => exit_code::FAILURE,
            _ => exit_code::NETWORK,
        }
    }
}

impl EnvironmentError {
    pub fn exit_code(&self) -> i32 {
        match self {
            EnvironmentError::InsufficientPrivilege { .. } => exit_code::PERMISSION,
            EnvironmentError::InsufficientDiskSpace { .. } => exit_code::RESOURCES,
            _ => exit_code::FAILURE,
        }
    }
}

impl StageError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StageError::Io { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied => {
                exit_code::PERMISSION
            }
            _ => exit_code::FAILURE,
        }
    }
}

impl BuildError {
    /// Exit code the binary returns for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Config(_) => exit_code::BAD_CONFIG,
            BuildError::Fetch(e) => e.exit_code(),
            BuildError::Environment(e) => e.exit_code(),
            BuildError::Stage(e) => e.exit_code(),
            BuildError::Packaging(_) | BuildError::Validation(_) => exit_code::FAILURE,
        }
    }
}

/// Exit code for the first typed error in a cause chain.
pub fn exit_code_of(error: &(dyn std::error::Error + 'static)) -> i32 {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(e) = err.downcast_ref::<BuildError>() {
            return e.exit_code();
        }
        if err.is::<ConfigError>() {
            return exit_code::BAD_CONFIG;
        }
        if let Some(e) = err.downcast_ref::<FetchError>() {
            return e.exit_code();
        }
        if let Some(e) = err.downcast_ref::<EnvironmentError>() {
            return e.exit_code();
        }
        if let Some(e) = err.downcast_ref::<StageError>() {
            return e.exit_code();
        }
        current = err.source();
    }
    exit_code::FAILURE
}
