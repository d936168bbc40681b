//! Remove build leftovers before packaging.

use std::fs::{self, OpenOptions};
use std::io;
use std::net::IpAddr;
use std::path::Path;
use walkdir::WalkDir;

use super::BuildState;
use crate::common::{empty_dir, write_file_with_dirs};
use crate::error::StageError;

/// Directories emptied (but kept) in the final tree.
pub const EMPTIED_DIRS: &[&str] = &["var/cache/apk", "tmp", "var/tmp"];

const HISTORY_FILES: &[&str] = &[".ash_history", ".bash_history", ".sh_history", ".viminfo"];

pub(super) fn final_cleanup(state: &mut BuildState<'_>) -> Result<(), StageError> {
    let root = state.root();
    println!("Cleaning up build leftovers...");

    let mut removed = 0;
    for rel in EMPTIED_DIRS {
        let dir = root.join(rel);
        removed += empty_dir(&dir).map_err(|source| StageError::Io { path: dir, source })?;
    }

    removed += remove_history(root)?;
    let truncated = truncate_logs(&root.join("var/log"))?;

    let resolv = root.join("etc/resolv.conf");
    match fs::remove_file(&resolv) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(StageError::Io { path: resolv, source }),
    }
    write_file_with_dirs(&resolv, resolv_conf(&state.config.network.dns_servers))
        .map_err(|source| StageError::Io { path: resolv, source })?;

    println!("  Removed {} entries, truncated {} log(s)", removed, truncated);
    Ok(())
}

pub fn resolv_conf(servers: &[IpAddr]) -> String {
    servers.iter().map(|ip| format!("nameserver {ip}\n")).collect()
}

/// Shell histories under `root/` and every `home/*/`.
fn remove_history(root: &Path) -> Result<usize, StageError> {
    let mut homes = vec![root.join("root")];
    if let Ok(entries) = fs::read_dir(root.join("home")) {
        homes.extend(entries.flatten().map(|e| e.path()));
    }

    let mut removed = 0;
    for home in homes {
        for name in HISTORY_FILES {
            let path = home.join(name);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(StageError::Io { path, source }),
            }
        }
    }
    Ok(removed)
}

/// Truncate every regular file under `dir` to zero bytes. Returns the count.
fn truncate_logs(dir: &Path) -> Result<usize, StageError> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| StageError::Io {
            path: dir.to_path_buf(),
            source: io::Error::other(e),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| StageError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolv_conf_lists_servers_in_order() {
        let servers: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap(), "2606:4700::1111".parse().unwrap()];
        assert_eq!(resolv_conf(&servers), "nameserver 1.1.1.1\nnameserver 2606:4700::1111\n");
    }

    #[test]
    fn test_truncate_logs_and_history() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("var/log/apk")).unwrap();
        fs::write(root.join("var/log/messages"), "boot\n").unwrap();
        fs::write(root.join("var/log/apk/apk.log"), "add curl\n").unwrap();
        fs::create_dir_all(root.join("home/admin")).unwrap();
        fs::create_dir_all(root.join("root")).unwrap();
        fs::write(root.join("root/.ash_history"), "ls\n").unwrap();
        fs::write(root.join("home/admin/.bash_history"), "ls\n").unwrap();

        assert_eq!(truncate_logs(&root.join("var/log")).unwrap(), 2);
        assert_eq!(fs::read(root.join("var/log/messages")).unwrap().len(), 0);
        assert!(root.join("var/log/apk/apk.log").exists());

        assert_eq!(remove_history(root).unwrap(), 2);
        assert!(!root.join("root/.ash_history").exists());
    }
}
