//! Shared test utilities for rootsmith tests.
//!
//! Nothing here touches the network or needs root: downloads come from a
//! [`FakeTransport`], host facts from a [`FakeProbe`] and commands go to a
//! [`FakeRunner`] that records them.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::os::unix::fs::symlink;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use rootsmith::cache::{ImageCache, Transport, TransportError};
use rootsmith::common::hash::sha256_bytes;
use rootsmith::common::pack_tree;
use rootsmith::config::resolve_str;
use rootsmith::exec::{BackgroundProcess, CommandRunner};
use rootsmith::preflight::EnvironmentProbe;
use rootsmith::process::{Cmd, CommandError, CommandResult};
use rootsmith::{BuildConfig, BuildPipeline};

pub const RUNTIME_VERSION: &str = "v1.28.4+k3s1";
pub const ALPINE_VERSION: &str = "3.18.10";
pub const MIRROR: &str = "https://mirror.test/alpine";

pub fn alpine_file(version: &str) -> String {
    format!("alpine-minirootfs-{version}-x86_64.tar.gz")
}

/// Release index listing with patch numbers that sort wrongly as strings.
pub fn release_index() -> String {
    ["3.18.2", "3.18.9", ALPINE_VERSION]
        .iter()
        .map(|v| format!("<a href=\"{0}\">{0}</a>\n", alpine_file(v)))
        .collect()
}

// =============================================================================
// Transport
// =============================================================================

enum Body {
    Bytes(Vec<u8>),
    Text(String),
}

/// Serves registered bodies by URL suffix and counts downloads.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<Vec<(String, Body)>>,
    downloads: Mutex<HashMap<String, usize>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve_bytes(&self, suffix: &str, bytes: Vec<u8>) {
        self.routes.lock().unwrap().push((suffix.to_string(), Body::Bytes(bytes)));
    }

    pub fn serve_text(&self, suffix: &str, text: &str) {
        self.routes.lock().unwrap().push((suffix.to_string(), Body::Text(text.to_string())));
    }

    /// Replace every route for `suffix`.
    pub fn replace_bytes(&self, suffix: &str, bytes: Vec<u8>) {
        self.routes.lock().unwrap().retain(|(s, _)| s != suffix);
        self.serve_bytes(suffix, bytes);
    }

    /// Serve `bytes` plus a matching `sha256sum`-style digest file.
    pub fn serve_with_digest(&self, suffix: &str, digest_suffix: &str, listed_name: &str, bytes: Vec<u8>) {
        let digest = sha256_bytes(&bytes);
        self.serve_text(digest_suffix, &format!("{digest}  {listed_name}\n"));
        self.serve_bytes(suffix, bytes);
    }

    /// Downloads of URLs ending in `suffix`.
    pub fn downloads_of(&self, suffix: &str) -> usize {
        self.downloads
            .lock()
            .unwrap()
            .iter()
            .filter(|(url, _)| url.ends_with(suffix))
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn total_downloads(&self) -> usize {
        self.downloads.lock().unwrap().values().sum()
    }

    fn find<T>(&self, url: &str, pick: impl Fn(&Body) -> T) -> Option<T> {
        self.routes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(suffix, _)| url.ends_with(suffix.as_str()))
            .map(|(_, body)| pick(body))
    }
}

impl Transport for FakeTransport {
    fn get_text(&self, url: &str) -> Result<String, TransportError> {
        self.find(url, |body| match body {
            Body::Text(text) => text.clone(),
            Body::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        })
        .ok_or(TransportError::NotFound)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64, TransportError> {
        *self.downloads.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let bytes = self
            .find(url, |body| match body {
                Body::Bytes(bytes) => bytes.clone(),
                Body::Text(text) => text.clone().into_bytes(),
            })
            .ok_or(TransportError::NotFound)?;
        fs::write(dest, &bytes)?;
        Ok(bytes.len() as u64)
    }
}

// =============================================================================
// Probe and runner
// =============================================================================

/// What the fake kernel has mounted. Shared by a [`FakeRunner`], which
/// mounts and unmounts, and a [`FakeProbe`], which lists.
#[derive(Default)]
pub struct FakeMounts {
    mounted: Mutex<Vec<PathBuf>>,
    /// Unmounting these always fails.
    pinned: Mutex<Vec<PathBuf>>,
}

impl FakeMounts {
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.mounted.lock().unwrap().clone()
    }

    /// A mount left behind by an earlier run.
    pub fn leave_mounted(&self, target: &Path) {
        self.mounted.lock().unwrap().push(target.to_path_buf());
    }

    pub fn pin(&self, target: &Path) {
        self.pinned.lock().unwrap().push(target.to_path_buf());
    }

    /// Rendered like `/proc/self/mounts`.
    pub fn table(&self) -> String {
        self.mounted()
            .iter()
            .map(|p| format!("none {} tmpfs rw 0 0\n", p.display()))
            .collect()
    }
}

/// A host with every tool installed; unprivileged by default.
pub struct FakeProbe {
    pub privileged: bool,
    pub free_mb: Option<u64>,
    pub mounts: Option<Arc<FakeMounts>>,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            privileged: false,
            free_mb: Some(100_000),
            mounts: None,
        }
    }
}

impl FakeProbe {
    /// A root host whose mount table is the one `runner` manipulates.
    pub fn privileged(runner: &FakeRunner) -> Self {
        Self {
            privileged: true,
            mounts: Some(Arc::clone(&runner.mounts)),
            ..Default::default()
        }
    }
}

impl EnvironmentProbe for FakeProbe {
    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn has_tool(&self, _program: &str) -> bool {
        true
    }

    fn free_disk_mb(&self, _path: &Path) -> Option<u64> {
        self.free_mb
    }

    fn kernel_filesystems(&self) -> Option<String> {
        Some("nodev\tproc\nnodev\toverlay\n".to_string())
    }

    fn cgroups_mounted(&self) -> bool {
        true
    }

    fn active_mounts(&self) -> Option<String> {
        self.mounts.as_ref().map(|m| m.table())
    }
}

/// Records every command; answers `k3s --version` with `version` and
/// `kubectl get nodes` from a queue of node listings.
pub struct FakeRunner {
    pub version: String,
    pub commands: Mutex<Vec<String>>,
    pub mounts: Arc<FakeMounts>,
    node_listings: Mutex<VecDeque<String>>,
    stopped: Arc<AtomicUsize>,
}

impl FakeRunner {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            commands: Mutex::new(Vec::new()),
            mounts: Arc::new(FakeMounts::default()),
            node_listings: Mutex::new(VecDeque::new()),
            stopped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer successive node polls with `listings`; empty once exhausted.
    pub fn with_node_listings<I, S>(self, listings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_listings.lock().unwrap().extend(listings.into_iter().map(Into::into));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Index of the first recorded command starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.starts_with(prefix))
    }

    /// Background processes that were stopped.
    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    fn failed(line: String, stderr: &str) -> CommandError {
        CommandError::Failed {
            prefix: line,
            code: 32,
            stderr: stderr.to_string(),
        }
    }
}

struct FakeProcess {
    stopped: Arc<AtomicUsize>,
    running: bool,
}

impl BackgroundProcess for FakeProcess {
    fn stop(&mut self) {
        if std::mem::take(&mut self.running) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: Cmd) -> Result<CommandResult, CommandError> {
        let line = cmd.display();
        self.commands.lock().unwrap().push(line.clone());
        let target = line.split_whitespace().last().map(PathBuf::from).unwrap_or_default();

        let stdout = if line.starts_with("umount") {
            if self.mounts.pinned.lock().unwrap().contains(&target) {
                return Err(Self::failed(line, "target is busy"));
            }
            self.mounts.mounted.lock().unwrap().retain(|m| *m != target);
            String::new()
        } else if line.starts_with("mount ") {
            self.mounts.mounted.lock().unwrap().push(target);
            String::new()
        } else if line.ends_with("k3s --version") {
            format!("k3s version {} (6ba6c1b6)\ngo version go1.20.11\n", self.version)
        } else if line.contains("kubectl get nodes") {
            self.node_listings.lock().unwrap().pop_front().unwrap_or_default()
        } else {
            String::new()
        };
        Ok(CommandResult {
            status: ExitStatus::from_raw(0),
            stdout,
            stderr: String::new(),
        })
    }

    fn spawn(&self, cmd: Cmd) -> Result<Box<dyn BackgroundProcess>, CommandError> {
        self.commands.lock().unwrap().push(cmd.display());
        Ok(Box::new(FakeProcess {
            stopped: Arc::clone(&self.stopped),
            running: true,
        }))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// A minimal Alpine-like minirootfs tree.
pub fn create_mock_minirootfs(root: &Path) {
    for dir in ["bin", "etc/apk", "lib", "sbin", "usr/bin", "var/cache/apk", "var/log", "var/tmp", "tmp", "root"] {
        fs::create_dir_all(root.join(dir)).expect("Failed to create mock rootfs dir");
    }
    fs::write(root.join("bin/busybox"), "#!/bin/sh\n").expect("Failed to create busybox");
    symlink("/bin/busybox", root.join("bin/sh")).expect("Failed to link sh");
    fs::write(root.join("sbin/apk"), "").expect("Failed to create apk");
    fs::write(root.join("etc/os-release"), "NAME=\"Alpine Linux\"\nID=alpine\nVERSION_ID=3.18.10\n").unwrap();
    fs::write(root.join("etc/alpine-release"), "3.18.10\n").unwrap();
    fs::write(root.join("etc/shadow"), "root:::0:::::\nbin:!::0:::::\n").unwrap();
    fs::write(root.join("etc/rc.conf"), "#rc_parallel=\"NO\"\n#rc_cgroup_mode=\"hybrid\"\n").unwrap();
    fs::write(root.join("etc/services"), "ssh 22/tcp\nhttp 80/tcp\n".repeat(200)).unwrap();
    fs::write(root.join("var/cache/apk/APKINDEX.tar.gz"), "index").unwrap();
    fs::write(root.join("var/log/messages"), "boot ok\n").unwrap();
    fs::write(root.join("tmp/scratch"), "x").unwrap();
    fs::write(root.join("root/.ash_history"), "ls\n").unwrap();
}

/// Pack a directory prepared by `fill` into `.tar.gz` bytes.
pub fn tarball(fill: impl FnOnce(&Path)) -> Vec<u8> {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let src = temp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fill(&src);
    let dest = temp.path().join("out.tar.gz");
    pack_tree(&src, &dest).expect("Failed to pack tarball");
    fs::read(dest).unwrap()
}

pub fn fake_k3s_binary() -> Vec<u8> {
    format!("#!/bin/sh\necho \"k3s version {RUNTIME_VERSION} (6ba6c1b6)\"\n").into_bytes()
}

/// Transport serving a release index, a minirootfs and a k3s binary, each
/// with its published digest.
pub fn serving_transport(minirootfs: Vec<u8>) -> FakeTransport {
    let transport = FakeTransport::new();
    transport.serve_text("/v3.18/releases/x86_64/", &release_index());
    let file = alpine_file(ALPINE_VERSION);
    transport.serve_with_digest(&file, &format!("{file}.sha256"), &file, minirootfs);
    transport.serve_with_digest("/k3s", "/sha256sum-amd64.txt", "k3s", fake_k3s_binary());
    transport
}

/// Test environment with temporary build, output and cache directories.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub base_dir: PathBuf,
    pub build_root: PathBuf,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base_dir = temp_dir.path().to_path_buf();
        Self {
            build_root: base_dir.join("build/rootfs"),
            output_dir: base_dir.join("output"),
            cache_dir: base_dir.join("cache"),
            base_dir,
            _temp_dir: temp_dir,
        }
    }

    pub fn config_text(&self, extra_build: &str) -> String {
        format!(
            "\
template:
  name: edge
  version: 1.0.0
  base_image: alpine:3.18
  description: Edge node
runtime:
  version: {RUNTIME_VERSION}
security:
  strip_setuid: true
build:
  build_root: {}
  output_dir: {}
  cache_dir: {}
  checksums: [sha256, sha512]
  require_root: false
  min_free_disk_mb: 64
  mirror: {MIRROR}
  fetch_attempts: 2
  fetch_delay_secs: 0
{extra_build}",
            self.build_root.display(),
            self.output_dir.display(),
            self.cache_dir.display(),
        )
    }

    pub fn config(&self) -> Arc<BuildConfig> {
        self.config_with("")
    }

    /// Extra lines are appended under `build:`; indent them by two spaces.
    pub fn config_with(&self, extra_build: &str) -> Arc<BuildConfig> {
        Arc::new(resolve_str(&self.config_text(extra_build), "test.yaml", &self.base_dir).expect("Invalid test config"))
    }

    pub fn cache(&self, config: &BuildConfig, transport: Arc<FakeTransport>) -> Arc<ImageCache> {
        Arc::new(ImageCache::from_config(config, transport).expect("Failed to open cache"))
    }

    pub fn pipeline(
        &self,
        config: Arc<BuildConfig>,
        transport: Arc<FakeTransport>,
        runner: Arc<FakeRunner>,
    ) -> BuildPipeline {
        self.pipeline_on(FakeProbe::default(), config, transport, runner)
    }

    pub fn pipeline_on(
        &self,
        probe: FakeProbe,
        config: Arc<BuildConfig>,
        transport: Arc<FakeTransport>,
        runner: Arc<FakeRunner>,
    ) -> BuildPipeline {
        let cache = self.cache(&config, transport);
        BuildPipeline::new(config, cache, Arc::new(probe), runner)
    }
}

pub fn assert_file_contains(path: &Path, needle: &str) {
    let content = fs::read_to_string(path).unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
    assert!(
        content.contains(needle),
        "{} should contain {:?}, got:\n{}",
        path.display(),
        needle,
        content
    );
}
