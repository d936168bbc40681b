//! Base system configuration: repositories, identity, network, packages.

use std::path::Path;

use super::{BuildState, Stage};
use crate::cache::version::major_minor;
use crate::common::write_file_with_dirs;
use crate::config::{BuildConfig, NetworkPolicy};
use crate::error::StageError;
use crate::exec::Operation;

pub(super) fn optimize_system(state: &mut BuildState<'_>) -> Result<(), StageError> {
    let config = state.config;
    let root = state.root().to_path_buf();
    let version = state.base_version.clone().ok_or(StageError::OutOfOrder {
        stage: Stage::OptimizeSystem.name(),
        missing: "the resolved base version",
    })?;

    println!("  Writing /etc configuration...");
    write(&root, "etc/apk/repositories", &repositories(config, &version))?;
    write(&root, "etc/hostname", &format!("{}\n", config.network.hostname))?;
    write(&root, "etc/hosts", &hosts(&config.network.hostname))?;
    write(&root, "etc/network/interfaces", &interfaces(&config.network))?;

    let stage = Stage::OptimizeSystem;
    state.exec(stage, &Operation::in_root("apk", ["update"]))?;

    let install = &config.packages.install;
    if !install.is_empty() {
        println!("  Installing {} package(s)", install.len());
        let args = ["add", "--no-cache"].into_iter().chain(install.iter().map(String::as_str));
        state.exec(stage, &Operation::in_root("apk", args))?;
    }

    let remove = &config.packages.remove;
    if !remove.is_empty() {
        println!("  Removing {} package(s)", remove.len());
        let args = std::iter::once("del").chain(remove.iter().map(String::as_str));
        state.exec(stage, &Operation::in_root("apk", args))?;
    }
    Ok(())
}

fn write(root: &Path, rel: &str, content: &str) -> Result<(), StageError> {
    let path = root.join(rel);
    write_file_with_dirs(&path, content).map_err(|source| StageError::Io { path, source })
}

/// `main` and `community` for the base release.
pub fn repositories(config: &BuildConfig, version: &str) -> String {
    let branch = major_minor(version);
    let mirror = config.build.mirror.trim_end_matches('/');
    format!("{mirror}/v{branch}/main\n{mirror}/v{branch}/community\n")
}

fn hosts(hostname: &str) -> String {
    format!(
        "127.0.0.1\tlocalhost localhost.localdomain\n\
         ::1\t\tlocalhost localhost.localdomain\n\
         127.0.1.1\t{hostname}\n"
    )
}

/// ifupdown config for the loopback and the primary interface.
pub fn interfaces(network: &NetworkPolicy) -> String {
    let mut out = String::from("auto lo\niface lo inet loopback\n\n");
    out.push_str(&format!("auto {}\n", network.interface));
    if network.dhcp {
        out.push_str(&format!("iface {} inet dhcp\n", network.interface));
        out.push_str(&format!("    hostname {}\n", network.hostname));
    } else {
        out.push_str(&format!("iface {} inet manual\n", network.interface));
    }
    out
}
