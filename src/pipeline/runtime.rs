//! k3s binary, its config file and its OpenRC service.

use serde::Serialize;
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use tracing::debug;

use super::{BuildState, Stage};
use crate::common::{write_file_mode, write_file_with_dirs};
use crate::config::RuntimeConfig;
use crate::error::StageError;
use crate::exec::Operation;

pub const RUNTIME_BINARY: &str = "usr/local/bin/k3s";
pub const RUNTIME_CONFIG: &str = "etc/rancher/k3s/config.yaml";
/// Multi-call names served by the k3s binary.
pub const RUNTIME_LINKS: &[&str] = &["kubectl", "crictl", "ctr"];

/// `etc/rancher/k3s/config.yaml`, keys as k3s spells its flags.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ServerConfig<'a> {
    write_kubeconfig_mode: &'a str,
    cluster_cidr: &'a str,
    service_cidr: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    disable: &'a [String],
}

pub(super) fn install_runtime(state: &mut BuildState<'_>) -> Result<(), StageError> {
    let binary = state.runtime_binary.as_ref().ok_or(StageError::OutOfOrder {
        stage: Stage::InstallRuntime.name(),
        missing: "the runtime binary",
    })?;
    let root = state.root().to_path_buf();
    let scratch = state.scratch();

    println!("Installing k3s {}...", state.config.runtime.version);
    let target = root.join(RUNTIME_BINARY);
    install_binary(&binary.path, &scratch.join("k3s"), &target)
        .map_err(|source| StageError::Io { path: target.clone(), source })?;

    let bin_dir = root.join("usr/local/bin");
    for name in RUNTIME_LINKS {
        let link = bin_dir.join(name);
        let _ = fs::remove_file(&link);
        symlink("k3s", &link).map_err(|source| StageError::Io { path: link, source })?;
    }

    let config_path = root.join(RUNTIME_CONFIG);
    let yaml = server_config(&state.config.runtime)?;
    write_file_mode(&config_path, yaml, 0o600).map_err(|source| StageError::Io {
        path: config_path,
        source,
    })?;

    println!("  Installed {} with {} link(s)", RUNTIME_BINARY, RUNTIME_LINKS.len());
    Ok(())
}

/// Stage next to the root, then rename into place so the root never holds a
/// half-written binary.
fn install_binary(source: &Path, staged: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = staged.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, staged)?;
    fs::set_permissions(staged, fs::Permissions::from_mode(0o755))?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Err(e) = fs::rename(staged, target) {
        debug!("rename into root failed ({}), copying", e);
        fs::copy(staged, target)?;
        fs::set_permissions(target, fs::Permissions::from_mode(0o755))?;
        fs::remove_file(staged)?;
    }
    Ok(())
}

pub fn server_config(runtime: &RuntimeConfig) -> Result<String, StageError> {
    let config = ServerConfig {
        write_kubeconfig_mode: "0644",
        cluster_cidr: &runtime.cluster_cidr,
        service_cidr: &runtime.service_cidr,
        disable: &runtime.disable,
    };
    serde_yaml::to_string(&config).map_err(|e| StageError::Render {
        what: "k3s config.yaml",
        message: e.to_string(),
    })
}

pub(super) fn configure_service(state: &mut BuildState<'_>) -> Result<(), StageError> {
    let runtime = &state.config.runtime;
    let root = state.root().to_path_buf();
    let service = runtime.service_name.clone();

    println!("Configuring {} service...", service);
    let init = root.join("etc/init.d").join(&service);
    write_file_mode(&init, init_script(&service), 0o755)
        .map_err(|source| StageError::Io { path: init, source })?;

    let conf = root.join("etc/conf.d").join(&service);
    write_file_with_dirs(&conf, conf_file(runtime)).map_err(|source| StageError::Io { path: conf, source })?;

    let rc_conf = root.join("etc/rc.conf");
    let current = match fs::read_to_string(&rc_conf) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(source) => return Err(StageError::Io { path: rc_conf, source }),
    };
    let mut updated = set_rc_option(&current, "rc_cgroup_mode", "unified");
    updated = set_rc_option(&updated, "rc_controller_cgroups", "YES");
    write_file_with_dirs(&rc_conf, updated).map_err(|source| StageError::Io { path: rc_conf, source })?;

    let stage = Stage::ConfigureRuntimeService;
    state.exec(stage, &Operation::in_root("rc-update", ["add", "cgroups", "boot"]))?;
    state.exec(stage, &Operation::in_root("rc-update", ["add", service.as_str(), "default"]))?;

    println!("  Service {} enabled", service);
    Ok(())
}

fn init_script(service: &str) -> String {
    format!(
        r#"#!/sbin/openrc-run

name="{service}"
description="Lightweight Kubernetes"
supervisor=supervise-daemon
command="/{RUNTIME_BINARY}"
command_args="server ${{K3S_OPTS}}"
output_log="/var/log/{service}.log"
error_log="/var/log/{service}.log"
pidfile="/run/{service}.pid"
respawn_delay=5
respawn_max=0

depend() {{
    need net
    after firewall
    want cgroups
}}

start_pre() {{
    rm -f /tmp/k3s.*
}}
"#
    )
}

fn conf_file(runtime: &RuntimeConfig) -> String {
    format!(
        "# Extra arguments for \"k3s server\"; the rest lives in /{RUNTIME_CONFIG}\nK3S_OPTS=\"{}\"\n",
        runtime.extra_args.join(" ")
    )
}

/// Set `key="value"` in an rc.conf, replacing a live or commented-out line.
pub fn set_rc_option(text: &str, key: &str, value: &str) -> String {
    let line = format!("{key}=\"{value}\"");
    let mut found = false;
    let mut out: Vec<String> = text
        .lines()
        .map(|l| {
            let bare = l.trim_start().trim_start_matches('#').trim_start();
            if !found && bare.starts_with(&format!("{key}=")) {
                found = true;
                line.clone()
            } else {
                l.to_string()
            }
        })
        .collect();
    if !found {
        out.push(line);
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}
