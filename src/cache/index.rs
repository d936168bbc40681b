//! `index.json` at the cache root.
//!
//! The index is a convenience; the tree is the source of truth. A missing or
//! unreadable index is rebuilt by walking `<dist>/<version>/<arch>/<file>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::common::hash::{hash_file, DigestAlgorithm};

pub const INDEX_FILE: &str = "index.json";
pub const DIGEST_SUFFIX: &str = ".sha256";
pub const PARTIAL_SUFFIX: &str = ".partial";

const INDEX_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub distribution: String,
    pub version: String,
    pub arch: String,
}

impl CacheKey {
    pub fn new(distribution: &str, version: &str, arch: &str) -> Self {
        Self {
            distribution: distribution.to_string(),
            version: version.to_string(),
            arch: arch.to_string(),
        }
    }

    /// Directory of this entry relative to the cache root.
    pub fn rel_dir(&self) -> PathBuf {
        PathBuf::from(&self.distribution)
            .join(&self.version)
            .join(&self.arch)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.distribution, self.version, self.arch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the file.
    pub digest: String,
    pub fetched_at: DateTime<Utc>,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheIndex {
    format: u32,
    entries: BTreeMap<String, CacheEntry>,
}

/// Path of the trust-anchor digest file for `file`.
pub fn digest_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(DIGEST_SUFFIX);
    PathBuf::from(name)
}

/// Write `<file>.sha256` in `sha256sum` format.
pub fn write_digest(file: &Path, digest: &str) -> io::Result<()> {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    fs::write(digest_path(file), format!("{digest}  {name}\n"))
}

/// Read the first token of `<file>.sha256`.
pub fn read_digest(file: &Path) -> Option<String> {
    let text = fs::read_to_string(digest_path(file)).ok()?;
    text.split_whitespace().next().map(str::to_ascii_lowercase)
}

impl CacheIndex {
    /// Load the index, rebuilding it from the tree if needed.
    pub fn load(root: &Path) -> io::Result<Self> {
        let path = root.join(INDEX_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<CacheIndex>(&text) {
                Ok(index) if index.format == INDEX_FORMAT => return Ok(index),
                Ok(index) => warn!(
                    "cache index {} has format {}, rebuilding",
                    path.display(),
                    index.format
                ),
                Err(e) => warn!("cache index {} is corrupt ({}), rebuilding", path.display(), e),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no cache index at {}, rebuilding", path.display());
            }
            Err(e) => return Err(e),
        }
        let index = Self::rebuild(root)?;
        index.save(root)?;
        Ok(index)
    }

    /// Reconstruct the index by walking the cache tree.
    pub fn rebuild(root: &Path) -> io::Result<Self> {
        let mut index = CacheIndex {
            format: INDEX_FORMAT,
            entries: BTreeMap::new(),
        };
        if !root.is_dir() {
            return Ok(index);
        }

        for entry in WalkDir::new(root).min_depth(4).max_depth(4).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(DIGEST_SUFFIX) || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let rel = entry.path().strip_prefix(root).map_err(io::Error::other)?;
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let [distribution, version, arch, _file] = parts.as_slice() else {
                continue;
            };

            let meta = entry.metadata().map_err(io::Error::other)?;
            let digest = match read_digest(entry.path()) {
                Some(d) => d,
                None => {
                    let d = hash_file(entry.path(), DigestAlgorithm::Sha256)?;
                    write_digest(entry.path(), &d)?;
                    d
                }
            };
            let fetched_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            index.insert(CacheEntry {
                key: CacheKey::new(distribution, version, arch),
                path: entry.path().to_path_buf(),
                digest,
                fetched_at,
                size: meta.len(),
            });
        }
        debug!("rebuilt cache index with {} entries", index.entries.len());
        Ok(index)
    }

    /// Persist via write-then-rename.
    pub fn save(&self, root: &Path) -> io::Result<()> {
        fs::create_dir_all(root)?;
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let tmp = root.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, root.join(INDEX_FILE))
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(&key.to_string())
    }

    pub fn insert(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key.to_string(), entry);
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.remove(&key.to_string())
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
