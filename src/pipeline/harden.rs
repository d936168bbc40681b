//! Security hardening of the finished tree.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::BuildState;
use crate::common::write_file_with_dirs;
use crate::error::StageError;

pub const SYSCTL_FILE: &str = "etc/sysctl.d/90-rootsmith.conf";

/// Kernel settings that keep the node routable for pod traffic.
const SYSCTL_SETTINGS: &[(&str, &str)] = &[
    ("kernel.kptr_restrict", "2"),
    ("kernel.dmesg_restrict", "1"),
    ("net.ipv4.conf.all.rp_filter", "1"),
    ("net.ipv4.conf.default.rp_filter", "1"),
    ("net.ipv4.conf.all.accept_redirects", "0"),
    ("net.ipv4.conf.all.send_redirects", "0"),
    ("net.ipv4.conf.all.accept_source_route", "0"),
    ("net.ipv6.conf.all.accept_redirects", "0"),
    ("net.ipv4.tcp_syncookies", "1"),
    ("net.ipv4.ip_forward", "1"),
    ("net.bridge.bridge-nf-call-iptables", "1"),
];

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StageError + '_ {
    move |source| StageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub(super) fn apply_hardening(state: &mut BuildState<'_>) -> Result<(), StageError> {
    let security = &state.config.security;
    let root = state.root();

    println!("Applying hardening...");

    if security.sysctl_hardening {
        let path = root.join(SYSCTL_FILE);
        write_file_with_dirs(&path, sysctl_conf()).map_err(io_err(&path))?;
        println!("  Wrote {}", SYSCTL_FILE);
    }

    if security.disable_root_login {
        let sshd = root.join("etc/ssh/sshd_config");
        if sshd.exists() {
            let text = fs::read_to_string(&sshd).map_err(io_err(&sshd))?;
            let text = set_directive(&text, "PermitRootLogin", "no");
            fs::write(&sshd, text).map_err(io_err(&sshd))?;
            println!("  Root login over ssh disabled");
        } else {
            debug!("no sshd_config, skipping");
        }
    }

    let shadow = root.join("etc/shadow");
    if shadow.exists() {
        if security.disable_root_login {
            let text = fs::read_to_string(&shadow).map_err(io_err(&shadow))?;
            fs::write(&shadow, lock_root_password(&text)).map_err(io_err(&shadow))?;
        }
        fs::set_permissions(&shadow, fs::Permissions::from_mode(0o640)).map_err(io_err(&shadow))?;
    }

    let securetty = root.join("etc/securetty");
    write_file_with_dirs(&securetty, "").map_err(io_err(&securetty))?;

    if security.strip_setuid {
        let stripped = strip_setuid(root, &security.allowed_setuid)?;
        println!("  Cleared setuid/setgid on {} file(s)", stripped.len());
        for path in &stripped {
            info!("stripped setuid from /{}", path);
        }
    }
    Ok(())
}

pub fn sysctl_conf() -> String {
    let mut out = String::new();
    for (key, value) in SYSCTL_SETTINGS {
        out.push_str(&format!("{key} = {value}\n"));
    }
    out
}

/// Set an sshd directive, replacing a live or commented-out occurrence.
pub fn set_directive(text: &str, key: &str, value: &str) -> String {
    let mut found = false;
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let bare = line.trim_start().trim_start_matches('#').trim_start();
        let matches = bare
            .split_whitespace()
            .next()
            .is_some_and(|word| word.eq_ignore_ascii_case(key));
        if matches && !found {
            found = true;
            lines.push(format!("{key} {value}"));
        } else if matches && !line.trim_start().starts_with('#') {
            // sshd honours the first occurrence; drop later live duplicates.
            continue;
        } else {
            lines.push(line.to_string());
        }
    }
    if !found {
        lines.push(format!("{key} {value}"));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Give root a locked password if it has none.
pub fn lock_root_password(shadow: &str) -> String {
    let mut out = String::with_capacity(shadow.len() + 1);
    for line in shadow.lines() {
        let mut fields: Vec<&str> = line.split(':').collect();
        if fields.first() == Some(&"root") && fields.get(1).is_some_and(|p| p.is_empty()) {
            fields[1] = "!";
            out.push_str(&fields.join(":"));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Clear setuid/setgid bits on every regular file not in `allowed`.
/// Returns the root-relative paths that were changed. Mounted pseudo
/// filesystems (the host's `/dev` in an isolated build) are not entered.
pub fn strip_setuid(root: &Path, allowed: &[String]) -> Result<Vec<String>, StageError> {
    let mut stripped = Vec::new();
    let walk = WalkDir::new(root)
        .follow_links(false)
        .same_file_system(true)
        .sort_by_file_name();
    for entry in walk {
        let entry = entry.map_err(|e| StageError::Io {
            path: root.to_path_buf(),
            source: io::Error::other(e),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let meta = entry.metadata().map_err(|e| StageError::Io {
            path: path.to_path_buf(),
            source: io::Error::other(e),
        })?;
        let mode = meta.permissions().mode();
        if mode & 0o6000 == 0 {
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(path).to_string_lossy().into_owned();
        if allowed.iter().any(|a| a.trim_start_matches('/') == rel) {
            continue;
        }
        fs::set_permissions(path, fs::Permissions::from_mode(mode & !0o6000)).map_err(io_err(path))?;
        stripped.push(rel);
    }
    Ok(stripped)
}
