//! Content hashing for cache verification, checksums and tree comparison.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::str::FromStr;
use walkdir::WalkDir;

/// Supported digest algorithms. The name doubles as the checksum file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub const ALL: [DigestAlgorithm; 2] = [DigestAlgorithm::Sha256, DigestAlgorithm::Sha512];

    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(format!("unsupported digest algorithm '{other}'")),
        }
    }
}

fn hash_reader<D: Digest, R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file's bytes, streaming.
pub fn hash_file(path: &Path, algorithm: DigestAlgorithm) -> io::Result<String> {
    let file = File::open(path)?;
    match algorithm {
        DigestAlgorithm::Sha256 => hash_reader::<Sha256, _>(file),
        DigestAlgorithm::Sha512 => hash_reader::<Sha512, _>(file),
    }
}

/// SHA-256 of an in-memory buffer.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Deterministic hash of a directory tree.
///
/// Covers relative paths, entry kinds, permission bits, file contents and
/// symlink targets. Two trees hash equal iff they look the same to a reader.
pub fn hash_tree(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name().follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0]);

        let meta = entry.path().symlink_metadata()?;
        hasher.update((meta.permissions().mode() & 0o7777).to_le_bytes());
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            hasher.update(b"L");
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
        } else if file_type.is_dir() {
            hasher.update(b"D");
        } else {
            hasher.update(b"F");
            hasher.update(hash_file(entry.path(), DigestAlgorithm::Sha256)?.as_bytes());
        }
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}
