//! Utilities for file operations with automatic parent directory creation.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Write a file, creating parent directories as needed.
pub fn write_file_with_dirs<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

/// Write a file with specific Unix permissions, creating parent directories as needed.
///
/// # Arguments
/// * `path` - Path to the file to write
/// * `content` - Content to write
/// * `mode` - Unix permission bits (e.g., 0o644, 0o600)
pub fn write_file_mode<P: AsRef<Path>, C: AsRef<[u8]>>(
    path: P,
    content: C,
    mode: u32,
) -> io::Result<()> {
    let path = path.as_ref();
    write_file_with_dirs(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Remove every entry inside `dir` but keep `dir` itself.
///
/// A missing directory is not an error. Returns the number of entries removed.
pub fn empty_dir(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_file_mode_creates_parents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a/b/c.conf");
        write_file_mode(&path, "x", 0o600).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_empty_dir_keeps_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("cache");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("file"), "x").unwrap();

        assert_eq!(empty_dir(&dir).unwrap(), 2);
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        assert_eq!(empty_dir(&temp.path().join("missing")).unwrap(), 0);
    }
}
