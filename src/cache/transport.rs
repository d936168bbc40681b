//! Network access for the cache.
//!
//! Downloads go through `curl` like every other host tool; the trait keeps the
//! cache testable without a network.

use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::process::{Cmd, CommandError};

const STATUS_MARKER: &str = "__ROOTSMITH_HTTP_STATUS__:";

/// curl exit code for an unreadable `file://` URL.
const CURL_FILE_COULDNT_READ: i32 = 37;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not found")]
    NotFound,

    #[error("HTTP {0}")]
    Http(u16),

    #[error("network error: {0}")]
    Network(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::NotFound | TransportError::Io(_) => false,
            TransportError::Http(code) => *code == 408 || *code == 429 || *code >= 500,
            TransportError::Network(_) => true,
        }
    }
}

pub trait Transport: Send + Sync {
    /// Fetch a small text resource (digest files, release indexes).
    fn get_text(&self, url: &str) -> Result<String, TransportError>;

    /// Download `url` to `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &Path) -> Result<u64, TransportError>;
}

/// Production transport backed by the `curl` binary.
#[derive(Debug, Clone)]
pub struct CurlTransport {
    connect_timeout_secs: u64,
}

impl Default for CurlTransport {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
        }
    }
}

impl CurlTransport {
    pub fn new(connect_timeout_secs: u64) -> Self {
        Self {
            connect_timeout_secs,
        }
    }

    fn base(&self) -> Cmd {
        Cmd::new("curl")
            .args(["-sSL", "--connect-timeout"])
            .arg(self.connect_timeout_secs.to_string())
            .allow_fail()
    }
}

/// Map curl's exit code and the reported HTTP status to a transport result.
fn classify(url: &str, exit_code: i32, status: Option<u16>, stderr: &str) -> Result<(), TransportError> {
    if exit_code == CURL_FILE_COULDNT_READ && url.starts_with("file://") {
        return Err(TransportError::NotFound);
    }
    if exit_code != 0 {
        return Err(TransportError::Network(format!(
            "curl exit code {}: {}",
            exit_code,
            stderr.trim()
        )));
    }
    match status {
        // file:// transfers report 000
        Some(0) | None => Ok(()),
        Some(code) if (200..300).contains(&code) => Ok(()),
        Some(404) | Some(410) => Err(TransportError::NotFound),
        Some(code) => Err(TransportError::Http(code)),
    }
}

fn spawn_error(e: CommandError) -> TransportError {
    TransportError::Network(e.to_string())
}

impl Transport for CurlTransport {
    fn get_text(&self, url: &str) -> Result<String, TransportError> {
        debug!("GET {}", url);
        let result = self
            .base()
            .arg("-w")
            .arg(format!("\n{STATUS_MARKER}%{{http_code}}"))
            .arg(url)
            .run()
            .map_err(spawn_error)?;

        let (body, status) = match result.stdout.rsplit_once(STATUS_MARKER) {
            Some((body, status)) => (body.trim_end_matches('\n'), status.trim().parse().ok()),
            None => (result.stdout.as_str(), None),
        };
        classify(url, result.code(), status, &result.stderr)?;
        Ok(body.to_string())
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64, TransportError> {
        debug!("download {} -> {}", url, dest.display());
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let result = self
            .base()
            .arg("-o")
            .arg_path(dest)
            .args(["-w", "%{http_code}"])
            .arg(url)
            .run()
            .map_err(spawn_error)?;

        let status = result.stdout_trimmed().parse().ok();
        if let Err(e) = classify(url, result.code(), status, &result.stderr) {
            let _ = fs::remove_file(dest);
            return Err(e);
        }
        Ok(fs::metadata(dest)?.len())
    }
}
