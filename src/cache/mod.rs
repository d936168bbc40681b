//! Content-addressed store for base images and runtime binaries.
//!
//! Layout: `<cache>/<distribution>/<version>/<arch>/<file>` with a
//! `<file>.sha256` trust anchor beside every artifact and an `index.json` at
//! the root. An entry is only ever returned after its bytes re-hash to the
//! recorded digest.

mod index;
pub mod source;
pub mod transport;
pub mod version;

pub use index::{CacheEntry, CacheIndex, CacheKey};
pub use source::{Alpine, ArtifactSource, K3s};
pub use transport::{CurlTransport, Transport, TransportError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::common::hash::{hash_file, DigestAlgorithm};
use crate::config::BuildConfig;
use crate::error::FetchError;
use crate::retry::{with_retry, Attempt, RetryError, RetryPolicy};
use index::{digest_path, read_digest, write_digest, PARTIAL_SUFFIX};

/// One artifact to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchRequest {
    pub distribution: String,
    pub version: String,
    pub arch: String,
}

impl FetchRequest {
    pub fn new(distribution: &str, version: &str, arch: &str) -> Self {
        Self {
            distribution: distribution.to_string(),
            version: version.to_string(),
            arch: arch.to_string(),
        }
    }

    fn key(&self) -> CacheKey {
        CacheKey::new(&self.distribution, &self.version, &self.arch)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: Vec<CacheKey>,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

pub struct ImageCache {
    root: PathBuf,
    transport: Arc<dyn Transport>,
    sources: HashMap<String, Arc<dyn ArtifactSource>>,
    policy: RetryPolicy,
    index: Mutex<CacheIndex>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl ImageCache {
    /// Open (or create) a cache at `root` with the default Alpine and k3s sources.
    pub fn open(
        root: &Path,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        mirror: &str,
    ) -> Result<Self, FetchError> {
        fs::create_dir_all(root).map_err(io_err(root))?;
        let index = CacheIndex::load(root).map_err(io_err(root))?;
        debug!("opened cache {} ({} entries)", root.display(), index.len());

        let mut cache = Self {
            root: root.to_path_buf(),
            transport,
            sources: HashMap::new(),
            policy,
            index: Mutex::new(index),
        };
        cache.register_source(Arc::new(Alpine::new(mirror)));
        cache.register_source(Arc::new(K3s::default()));
        Ok(cache)
    }

    /// Cache configured from `build.cache_dir`, `build.mirror` and the fetch
    /// retry settings.
    pub fn from_config(config: &BuildConfig, transport: Arc<dyn Transport>) -> Result<Self, FetchError> {
        Self::open(
            &config.build.cache_dir,
            transport,
            config.build.retry_policy(),
            &config.build.mirror,
        )
    }

    /// Add or replace a distribution.
    pub fn register_source(&mut self, source: Arc<dyn ArtifactSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn source(&self, distribution: &str) -> Result<&Arc<dyn ArtifactSource>, FetchError> {
        self.sources
            .get(distribution)
            .ok_or_else(|| FetchError::UnknownDistribution(distribution.to_string()))
    }

    fn index(&self) -> MutexGuard<'_, CacheIndex> {
        // A panic while holding the lock cannot leave the map half-written.
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of all indexed entries.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.index().entries().cloned().collect()
    }

    /// Turn a version specifier into a concrete version.
    ///
    /// `major.minor` picks the highest patch listed in the release index. An
    /// unreachable or empty index falls back to `<prefix>.0`.
    pub fn resolve_version(&self, distribution: &str, spec: &str, arch: &str) -> Result<String, FetchError> {
        let source = self.source(distribution)?;
        if source.is_concrete(spec) {
            return Ok(spec.to_string());
        }
        if !version::is_minor_prefix(spec) {
            return Err(FetchError::InvalidVersionSpec {
                distribution: distribution.to_string(),
                spec: spec.to_string(),
            });
        }

        let fallback = format!("{spec}.0");
        let Some(url) = source.index_url(spec, arch) else {
            warn!("{} has no release index; using {}", distribution, fallback);
            return Ok(fallback);
        };

        match self.get_text(&url) {
            Ok(text) => {
                let candidates = source.parse_index(&text, arch);
                match version::highest_matching(candidates.iter().map(String::as_str), spec) {
                    Some(found) => {
                        info!("resolved {}:{} -> {}", distribution, spec, found);
                        Ok(found)
                    }
                    None => {
                        warn!("release index {} lists no {} releases; using {}", url, spec, fallback);
                        Ok(fallback)
                    }
                }
            }
            Err(e) => {
                warn!("release index unavailable ({}); using {}", e, fallback);
                Ok(fallback)
            }
        }
    }

    /// Whether `path` hashes to `digest`.
    pub fn verify(&self, path: &Path, digest: &str) -> bool {
        match hash_file(path, DigestAlgorithm::Sha256) {
            Ok(actual) => actual.eq_ignore_ascii_case(digest),
            Err(_) => false,
        }
    }

    /// Return a verified local copy, downloading it if necessary.
    pub fn fetch(&self, distribution: &str, version: &str, arch: &str) -> Result<CacheEntry, FetchError> {
        let source = Arc::clone(self.source(distribution)?);
        let key = CacheKey::new(distribution, version, arch);
        let dir = self.root.join(key.rel_dir());
        let path = dir.join(source.file_name(version, arch));

        if let Some(entry) = self.cached(&key, &path) {
            debug!("cache hit {}", key);
            return Ok(entry);
        }

        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let url = source.artifact_url(version, arch);
        info!("downloading {}", url);

        let mut partial = path.as_os_str().to_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        let size = self.download(&url, &partial)?;
        let actual = hash_file(&partial, DigestAlgorithm::Sha256).map_err(io_err(&partial))?;

        if let Some(digest_url) = source.digest_url(version, arch) {
            match self.published_digest(&digest_url, &source.file_name(version, arch)) {
                Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
                    let _ = fs::remove_file(&partial);
                    return Err(FetchError::ChecksumMismatch {
                        path,
                        expected,
                        actual,
                    });
                }
                Some(_) => debug!("{} matches published digest", key),
                None => warn!("no published digest for {}; trusting download", key),
            }
        }

        fs::rename(&partial, &path).map_err(io_err(&path))?;
        write_digest(&path, &actual).map_err(io_err(&path))?;

        let entry = CacheEntry {
            key,
            path,
            digest: actual,
            fetched_at: Utc::now(),
            size,
        };
        let mut index = self.index();
        index.insert(entry.clone());
        index.save(&self.root).map_err(io_err(&self.root))?;
        Ok(entry)
    }

    /// Verified entry for `key`, or `None` after purging anything stale.
    fn cached(&self, key: &CacheKey, path: &Path) -> Option<CacheEntry> {
        let indexed = self.index().get(key).cloned();
        let entry = match indexed {
            Some(entry) => entry,
            None => {
                // On disk but not indexed: adopt it if its anchor still holds.
                let digest = read_digest(path)?;
                let meta = fs::metadata(path).ok()?;
                CacheEntry {
                    key: key.clone(),
                    path: path.to_path_buf(),
                    digest,
                    fetched_at: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
                    size: meta.len(),
                }
            }
        };

        if entry.path.is_file() && self.verify(&entry.path, &entry.digest) {
            let mut index = self.index();
            if index.get(key).is_none() {
                index.insert(entry.clone());
                if let Err(e) = index.save(&self.root) {
                    warn!("could not save cache index: {}", e);
                }
            }
            return Some(entry);
        }

        warn!("cache entry {} failed verification, purging", key);
        self.purge(key, &entry.path);
        None
    }

    fn purge(&self, key: &CacheKey, path: &Path) {
        let _ = fs::remove_file(path);
        let _ = fs::remove_file(digest_path(path));
        let mut index = self.index();
        index.remove(key);
        if let Err(e) = index.save(&self.root) {
            warn!("could not save cache index: {}", e);
        }
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let result = with_retry(&self.policy, &format!("download {url}"), |_| {
            match self.transport.download(url, dest) {
                Ok(size) => Attempt::Done(size),
                Err(e) if e.is_retryable() => Attempt::Retry(e),
                Err(e) => Attempt::Fail(e),
            }
        });
        result.map_err(|e| {
            let _ = fs::remove_file(dest);
            fetch_error(url, dest, e)
        })
    }

    fn get_text(&self, url: &str) -> Result<String, FetchError> {
        with_retry(&self.policy, &format!("fetch {url}"), |_| match self.transport.get_text(url) {
            Ok(text) => Attempt::Done(text),
            Err(e) if e.is_retryable() => Attempt::Retry(e),
            Err(e) => Attempt::Fail(e),
        })
        .map_err(|e| fetch_error(url, Path::new(url), e))
    }

    fn published_digest(&self, url: &str, file_name: &str) -> Option<String> {
        match self.get_text(url) {
            Ok(text) => {
                let digest = source::parse_digest(&text, file_name);
                if digest.is_none() {
                    warn!("{} does not list {}", url, file_name);
                }
                digest
            }
            Err(e) => {
                warn!("could not fetch published digest: {}", e);
                None
            }
        }
    }

    /// Fetch several artifacts in parallel. Duplicate requests are fetched once.
    ///
    /// Returns after every request has finished; results are in request order.
    pub fn fetch_many(&self, requests: &[FetchRequest]) -> Result<Vec<CacheEntry>, FetchError> {
        let mut unique: Vec<&FetchRequest> = Vec::new();
        for request in requests {
            if !unique.contains(&request) {
                unique.push(request);
            }
        }
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let threads = cpus.min(unique.len());
        let fetch_one = |r: &&FetchRequest| (r.key(), self.fetch(&r.distribution, &r.version, &r.arch));

        let results: Vec<(CacheKey, Result<CacheEntry, FetchError>)> =
            match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
                Ok(pool) => pool.install(|| unique.par_iter().map(fetch_one).collect()),
                Err(e) => {
                    warn!("could not start fetch pool ({}); fetching sequentially", e);
                    unique.iter().map(fetch_one).collect()
                }
            };

        let mut by_key: HashMap<CacheKey, Result<CacheEntry, FetchError>> = results.into_iter().collect();
        let mut entries = Vec::with_capacity(requests.len());
        for request in requests {
            match by_key.get(&request.key()) {
                Some(Ok(entry)) => entries.push(entry.clone()),
                Some(Err(_)) => {
                    if let Some(Err(e)) = by_key.remove(&request.key()) {
                        return Err(e);
                    }
                }
                None => {}
            }
        }
        Ok(entries)
    }

    /// Evict by age, then oldest-first until under `max_size_bytes`.
    pub fn evict(&self, max_age_days: Option<u64>, max_size_bytes: Option<u64>) -> Result<EvictionReport, FetchError> {
        self.evict_at(Utc::now(), max_age_days, max_size_bytes)
    }

    /// [`evict`](Self::evict) with an explicit clock.
    pub fn evict_at(
        &self,
        now: DateTime<Utc>,
        max_age_days: Option<u64>,
        max_size_bytes: Option<u64>,
    ) -> Result<EvictionReport, FetchError> {
        let mut index = self.index();
        let mut entries: Vec<CacheEntry> = index.entries().cloned().collect();
        entries.sort_by(|a, b| a.fetched_at.cmp(&b.fetched_at).then_with(|| a.key.cmp(&b.key)));

        let mut doomed: Vec<CacheEntry> = Vec::new();
        if let Some(days) = max_age_days {
            let cutoff = now - ChronoDuration::days(days.min(1_000_000) as i64);
            let (old, keep): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.fetched_at < cutoff);
            doomed.extend(old);
            entries = keep;
        }

        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if let Some(limit) = max_size_bytes {
            let mut keep = Vec::new();
            for entry in entries {
                if total > limit {
                    total -= entry.size;
                    doomed.push(entry);
                } else {
                    keep.push(entry);
                }
            }
            entries = keep;
        }

        let mut report = EvictionReport {
            remaining_bytes: entries.iter().map(|e| e.size).sum(),
            ..Default::default()
        };
        for entry in doomed {
            info!("evicting {} ({} bytes)", entry.key, entry.size);
            for file in [entry.path.clone(), digest_path(&entry.path)] {
                match fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(&file)(e)),
                }
            }
            prune_empty_dirs(&self.root, entry.path.parent());
            index.remove(&entry.key);
            report.freed_bytes += entry.size;
            report.removed.push(entry.key);
        }

        index.save(&self.root).map_err(io_err(&self.root))?;
        Ok(report)
    }
}

/// Remove now-empty directories from `dir` up to (not including) `root`.
fn prune_empty_dirs(root: &Path, mut dir: Option<&Path>) {
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) || fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

fn fetch_error(url: &str, path: &Path, err: RetryError<TransportError>) -> FetchError {
    match err {
        RetryError::Permanent(TransportError::NotFound) => FetchError::NotFound { url: url.to_string() },
        RetryError::Permanent(TransportError::Io(source)) => FetchError::Io {
            path: path.to_path_buf(),
            source,
        },
        RetryError::Permanent(e) => FetchError::NetworkExhausted {
            url: url.to_string(),
            attempts: 1,
            last_error: e.to_string(),
        },
        RetryError::Exhausted { attempts, last } => FetchError::NetworkExhausted {
            url: url.to_string(),
            attempts,
            last_error: last.to_string(),
        },
    }
}
