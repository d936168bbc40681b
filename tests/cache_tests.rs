//! Image cache behavior against a fake transport.

mod helpers;

use std::fs;
use std::sync::Arc;
use walkdir::WalkDir;

use helpers::*;
use rootsmith::cache::FetchRequest;
use rootsmith::common::hash::sha256_bytes;
use rootsmith::FetchError;

fn alpine_bytes() -> Vec<u8> {
    tarball(create_mock_minirootfs)
}

#[test]
fn test_resolve_version_picks_highest_patch_numerically() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(alpine_bytes()));
    let cache = env.cache(&config, transport);

    let version = cache.resolve_version("alpine", "3.18", "amd64").unwrap();
    assert_eq!(version, "3.18.10");

    // Concrete versions pass through untouched
    assert_eq!(cache.resolve_version("alpine", "3.17.4", "amd64").unwrap(), "3.17.4");
    assert_eq!(cache.resolve_version("k3s", RUNTIME_VERSION, "amd64").unwrap(), RUNTIME_VERSION);
}

#[test]
fn test_resolve_version_falls_back_without_index() {
    let env = TestEnv::new();
    let config = env.config();
    let cache = env.cache(&config, Arc::new(FakeTransport::new()));

    assert_eq!(cache.resolve_version("alpine", "3.19", "amd64").unwrap(), "3.19.0");
}

#[test]
fn test_resolve_version_rejects_garbage_spec() {
    let env = TestEnv::new();
    let config = env.config();
    let cache = env.cache(&config, Arc::new(FakeTransport::new()));

    let err = cache.resolve_version("alpine", "latest", "amd64").unwrap_err();
    assert!(matches!(err, FetchError::InvalidVersionSpec { .. }), "got {err:?}");
}

#[test]
fn test_fetch_twice_downloads_once() {
    let env = TestEnv::new();
    let config = env.config();
    let bytes = alpine_bytes();
    let transport = Arc::new(serving_transport(bytes.clone()));
    let cache = env.cache(&config, Arc::clone(&transport));
    let file = alpine_file(ALPINE_VERSION);

    let first = cache.fetch("alpine", ALPINE_VERSION, "amd64").unwrap();
    let second = cache.fetch("alpine", ALPINE_VERSION, "amd64").unwrap();

    assert_eq!(transport.downloads_of(&file), 1);
    assert_eq!(first.path, second.path);
    assert_eq!(first.digest, sha256_bytes(&bytes));
    assert!(first.path.starts_with(&env.cache_dir));
    assert!(cache.verify(&first.path, &first.digest));
}

#[test]
fn test_tampered_entry_is_downloaded_again() {
    let env = TestEnv::new();
    let config = env.config();
    let bytes = alpine_bytes();
    let transport = Arc::new(serving_transport(bytes.clone()));
    let cache = env.cache(&config, Arc::clone(&transport));
    let file = alpine_file(ALPINE_VERSION);

    let entry = cache.fetch("alpine", ALPINE_VERSION, "amd64").unwrap();
    fs::write(&entry.path, b"corrupted on disk").unwrap();
    assert!(!cache.verify(&entry.path, &entry.digest));

    let refetched = cache.fetch("alpine", ALPINE_VERSION, "amd64").unwrap();
    assert_eq!(transport.downloads_of(&file), 2);
    assert_eq!(refetched.digest, sha256_bytes(&bytes));
    assert_eq!(fs::read(&refetched.path).unwrap(), bytes);
}

#[test]
fn test_checksum_mismatch_leaves_nothing_behind() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = FakeTransport::new();
    let file = alpine_file(ALPINE_VERSION);
    transport.serve_text(&format!("{file}.sha256"), &format!("{}  {file}\n", "0".repeat(64)));
    transport.serve_bytes(&file, alpine_bytes());
    let cache = env.cache(&config, Arc::new(transport));

    let err = cache.fetch("alpine", ALPINE_VERSION, "amd64").unwrap_err();
    match &err {
        FetchError::ChecksumMismatch { expected, actual, .. } => {
            assert_eq!(expected, &"0".repeat(64));
            assert_ne!(actual, expected);
        }
        other => panic!("expected ChecksumMismatch, got {other:?}"),
    }

    let leftovers: Vec<_> = WalkDir::new(&env.cache_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name() != "index.json")
        .map(|e| e.path().to_path_buf())
        .collect();
    assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    assert!(cache.entries().is_empty());
}

#[test]
fn test_missing_artifact_is_not_found() {
    let env = TestEnv::new();
    let config = env.config();
    let cache = env.cache(&config, Arc::new(FakeTransport::new()));

    let err = cache.fetch("k3s", RUNTIME_VERSION, "amd64").unwrap_err();
    match err {
        FetchError::NotFound { url } => assert!(url.contains("v1.28.4%2Bk3s1"), "url: {url}"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn test_unknown_distribution_is_rejected() {
    let env = TestEnv::new();
    let config = env.config();
    let cache = env.cache(&config, Arc::new(FakeTransport::new()));

    let err = cache.fetch("debian", "12", "amd64").unwrap_err();
    assert!(matches!(err, FetchError::UnknownDistribution(ref d) if d == "debian"));
}

#[test]
fn test_fetch_many_returns_request_order() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(alpine_bytes()));
    let cache = env.cache(&config, Arc::clone(&transport));

    let requests = [
        FetchRequest::new("k3s", RUNTIME_VERSION, "amd64"),
        FetchRequest::new("alpine", ALPINE_VERSION, "amd64"),
        FetchRequest::new("k3s", RUNTIME_VERSION, "amd64"),
    ];
    let entries = cache.fetch_many(&requests).unwrap();

    let distributions: Vec<&str> = entries.iter().map(|e| e.key.distribution.as_str()).collect();
    assert_eq!(distributions, ["k3s", "alpine", "k3s"]);
    assert_eq!(transport.downloads_of("/k3s"), 1);
    assert_eq!(transport.total_downloads(), 2);
}

#[test]
fn test_fetch_many_reports_first_failure() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = FakeTransport::new();
    let file = alpine_file(ALPINE_VERSION);
    transport.serve_with_digest(&file, &format!("{file}.sha256"), &file, alpine_bytes());
    let cache = env.cache(&config, Arc::new(transport));

    let requests = [
        FetchRequest::new("alpine", ALPINE_VERSION, "amd64"),
        FetchRequest::new("k3s", RUNTIME_VERSION, "amd64"),
    ];
    let err = cache.fetch_many(&requests).unwrap_err();
    assert!(matches!(err, FetchError::NotFound { .. }), "got {err:?}");

    // The successful fetch is still cached
    assert_eq!(cache.entries().len(), 1);
}

#[test]
fn test_lost_index_is_rebuilt_from_digest_files() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(alpine_bytes()));
    let file = alpine_file(ALPINE_VERSION);

    {
        let cache = env.cache(&config, Arc::clone(&transport));
        cache.fetch("alpine", ALPINE_VERSION, "amd64").unwrap();
    }
    fs::remove_file(env.cache_dir.join("index.json")).unwrap();

    let cache = env.cache(&config, Arc::clone(&transport));
    let entry = cache.fetch("alpine", ALPINE_VERSION, "amd64").unwrap();
    assert_eq!(transport.downloads_of(&file), 1);
    assert_eq!(cache.entries().len(), 1);
    assert!(cache.verify(&entry.path, &entry.digest));
}

#[test]
fn test_evict_by_size_removes_files() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(alpine_bytes()));
    let cache = env.cache(&config, transport);

    let alpine = cache.fetch("alpine", ALPINE_VERSION, "amd64").unwrap();
    let k3s = cache.fetch("k3s", RUNTIME_VERSION, "amd64").unwrap();

    let report = cache.evict(None, Some(0)).unwrap();
    assert_eq!(report.removed.len(), 2);
    assert_eq!(report.freed_bytes, alpine.size + k3s.size);
    assert_eq!(report.remaining_bytes, 0);
    assert!(!alpine.path.exists());
    assert!(!k3s.path.exists());
    assert!(cache.entries().is_empty());
}
