//! Build pipeline runs against a fake mirror, a described host and a
//! recording command runner.

mod helpers;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use helpers::*;
use rootsmith::common::hash_tree;
use rootsmith::exec::{ExecutionContext, Executor, Operation, Outcome};
use rootsmith::pipeline::{lock_path, BuildRootLock};
use rootsmith::{BuildError, CancelToken, EnvironmentError, Stage, StageError};

fn scratch_of(root: &Path) -> std::path::PathBuf {
    let mut name = root.as_os_str().to_os_string();
    name.push(".work");
    name.into()
}

#[test]
fn test_build_on_host_produces_configured_root() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(tarball(create_mock_minirootfs)));
    let runner = Arc::new(FakeRunner::new(RUNTIME_VERSION));
    let pipeline = env.pipeline(config, transport, Arc::clone(&runner));

    let outcome = pipeline.run().expect("build should succeed");
    let root = &env.build_root;

    assert_eq!(outcome.context, ExecutionContext::Host);
    assert_eq!(outcome.base_version, ALPINE_VERSION);
    assert_eq!(outcome.runtime_version, RUNTIME_VERSION);
    let stages: Vec<Stage> = outcome.stage_durations.iter().map(|(s, _)| *s).collect();
    assert_eq!(stages, Stage::ALL);

    // Package manager work is deferred, never run against the host
    assert!(outcome.skipped_operations.iter().any(|op| op.starts_with("apk add")));
    assert!(outcome.skipped_operations.iter().any(|op| op.starts_with("rc-update add k3s")));
    assert!(runner.commands().iter().all(|c| !c.starts_with("apk") && !c.starts_with("chroot")));
    assert!(runner.commands().iter().any(|c| c.ends_with("usr/local/bin/k3s --version")));

    assert_file_contains(&root.join("etc/hostname"), "edge");
    assert_file_contains(&root.join("etc/apk/repositories"), "https://mirror.test/alpine/v3.18/main");
    assert_file_contains(&root.join("etc/apk/repositories"), "https://mirror.test/alpine/v3.18/community");
    assert_file_contains(&root.join("etc/rancher/k3s/config.yaml"), "write-kubeconfig-mode");
    assert_file_contains(&root.join("etc/init.d/k3s"), "supervise-daemon");
    assert_file_contains(&root.join("etc/rc.conf"), "rc_cgroup_mode=\"unified\"");
    assert_file_contains(&root.join("etc/shadow"), "root:!:");

    let binary = root.join("usr/local/bin/k3s");
    assert_eq!(fs::read(&binary).unwrap(), fake_k3s_binary());
    assert_eq!(fs::metadata(&binary).unwrap().permissions().mode() & 0o777, 0o755);
    assert_eq!(fs::read_link(root.join("usr/local/bin/kubectl")).unwrap(), Path::new("k3s"));

    // Build leftovers are gone
    assert!(!root.join("root/.ash_history").exists());
    assert!(!root.join("tmp/scratch").exists());
    assert_eq!(fs::read_dir(root.join("var/cache/apk")).unwrap().count(), 0);
    assert_eq!(fs::read_to_string(root.join("var/log/messages")).unwrap(), "");

    assert!(lock_path(root).exists());
    let report = outcome.finish();
    assert!(report.lock_released);
    assert!(!root.exists());
    assert!(!lock_path(root).exists());
    assert!(!scratch_of(root).exists());
}

#[test]
fn test_isolated_build_runs_in_root_and_releases_mounts_before_returning() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(tarball(create_mock_minirootfs)));
    let runner = Arc::new(FakeRunner::new(RUNTIME_VERSION));
    let probe = FakeProbe::privileged(&runner);
    let pipeline = env.pipeline_on(probe, config, transport, Arc::clone(&runner));

    let outcome = pipeline.run().expect("build should succeed");
    let root = env.build_root.display().to_string();

    assert_eq!(outcome.context, ExecutionContext::Isolated);
    assert!(outcome.skipped_operations.is_empty(), "skipped: {:?}", outcome.skipped_operations);

    let mounted = runner.position(&format!("mount -t proc proc {root}/proc")).expect("proc mounted");
    let installed = runner.position(&format!("chroot {root} apk add")).expect("packages installed in root");
    let enabled = runner
        .position(&format!("chroot {root} rc-update add k3s default"))
        .expect("service enabled in root");
    let verified = runner
        .position(&format!("chroot {root} /usr/local/bin/k3s --version"))
        .expect("version checked in root");
    let released = runner.position("umount").expect("mounts released");
    assert!(mounted < installed && installed < enabled && enabled < verified && verified < released);

    // Released by run(), before anything could package the tree
    let commands = runner.commands();
    for rel in ["dev", "sys", "proc"] {
        assert!(commands.contains(&format!("umount {root}/{rel}")), "{rel} not unmounted");
    }
    assert!(runner.mounts.mounted().is_empty());
    assert_file_contains(&env.build_root.join("etc/hostname"), "edge");

    let report = outcome.finish();
    assert!(report.still_mounted.is_empty());
    assert_eq!(runner.commands().len(), commands.len());
    assert!(!env.build_root.exists());
}

#[test]
fn test_isolated_failure_unmounts_and_keeps_root() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(tarball(create_mock_minirootfs)));
    let runner = Arc::new(FakeRunner::new("v1.27.9+k3s1"));
    let probe = FakeProbe::privileged(&runner);
    let pipeline = env.pipeline_on(probe, config, transport, Arc::clone(&runner));

    let failure = pipeline.run().unwrap_err();
    assert_eq!(failure.stage, Stage::VerifyBuild);
    assert!(matches!(
        failure.source,
        BuildError::Stage(StageError::RuntimeVersionMismatch { .. })
    ));

    let root = env.build_root.display().to_string();
    let commands = runner.commands();
    for rel in ["dev", "sys", "proc"] {
        assert!(commands.contains(&format!("umount {root}/{rel}")), "{rel} not unmounted");
    }
    assert!(runner.mounts.mounted().is_empty());
    assert!(env.build_root.join("usr/local/bin/k3s").exists());
    assert!(!lock_path(&env.build_root).exists());
}

#[test]
fn test_unreleasable_mount_fails_build_and_keeps_root() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(tarball(create_mock_minirootfs)));
    let runner = Arc::new(FakeRunner::new(RUNTIME_VERSION));
    runner.mounts.pin(&env.build_root.join("dev"));
    let probe = FakeProbe::privileged(&runner);
    let pipeline = env.pipeline_on(probe, config, transport, Arc::clone(&runner));

    let failure = pipeline.run().unwrap_err();
    assert_eq!(failure.stage, Stage::VerifyBuild);
    match failure.source {
        BuildError::Stage(StageError::StillMounted { mounts, .. }) => {
            assert_eq!(mounts, [env.build_root.join("dev")]);
        }
        other => panic!("expected StillMounted, got {other:?}"),
    }
    assert!(env.build_root.exists());
    assert!(!lock_path(&env.build_root).exists());
}

#[test]
fn test_stale_mount_is_released_before_root_is_wiped() {
    let env = TestEnv::new();
    let stale = env.build_root.join("dev");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("null"), "host device").unwrap();

    let config = env.config();
    let transport = Arc::new(serving_transport(tarball(create_mock_minirootfs)));
    let runner = Arc::new(FakeRunner::new(RUNTIME_VERSION));
    runner.mounts.leave_mounted(&stale);
    let probe = FakeProbe::privileged(&runner);
    let pipeline = env.pipeline_on(probe, config, transport, Arc::clone(&runner));

    let outcome = pipeline.run().expect("build should succeed");
    let first_umount = runner.position(&format!("umount {}", stale.display())).expect("stale mount released");
    let first_mount = runner.position("mount ").expect("isolation mounted");
    assert!(first_umount < first_mount);
    assert!(!stale.join("null").exists());
    outcome.finish();
}

#[test]
fn test_stale_mount_that_cannot_be_released_blocks_wipe() {
    let env = TestEnv::new();
    let stale = env.build_root.join("dev");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("null"), "host device").unwrap();

    let config = env.config();
    let transport = Arc::new(serving_transport(tarball(create_mock_minirootfs)));
    let runner = Arc::new(FakeRunner::new(RUNTIME_VERSION));
    runner.mounts.leave_mounted(&stale);
    runner.mounts.pin(&stale);
    let probe = FakeProbe::privileged(&runner);
    let pipeline = env.pipeline_on(probe, config, Arc::clone(&transport), Arc::clone(&runner));

    let failure = pipeline.run().unwrap_err();
    assert_eq!(failure.stage, Stage::PrepareBuildRoot);
    match failure.source {
        BuildError::Stage(StageError::StillMounted { mounts, .. }) => assert_eq!(mounts, [stale.clone()]),
        other => panic!("expected StillMounted, got {other:?}"),
    }
    assert_file_contains(&stale.join("null"), "host device");
    assert_eq!(transport.total_downloads(), 0);
    assert!(!lock_path(&env.build_root).exists());
}

#[test]
fn test_keep_build_root_survives_finish() {
    let env = TestEnv::new();
    let config = env.config_with("  keep_build_root: true\n");
    let transport = Arc::new(serving_transport(tarball(create_mock_minirootfs)));
    let pipeline = env.pipeline(config, transport, Arc::new(FakeRunner::new(RUNTIME_VERSION)));

    let report = pipeline.run().unwrap().finish();
    assert!(report.lock_released);
    assert!(env.build_root.join("usr/local/bin/k3s").exists());
    assert!(!lock_path(&env.build_root).exists());
}

#[test]
fn test_empty_base_image_fails_extract_and_keeps_root() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(tarball(|_| {})));
    let pipeline = env.pipeline(config, transport, Arc::new(FakeRunner::new(RUNTIME_VERSION)));

    let failure = pipeline.run().unwrap_err();
    assert_eq!(failure.stage, Stage::ExtractBaseImage);
    match &failure.source {
        BuildError::Stage(StageError::MissingSkeleton { missing, .. }) => {
            assert!(missing.iter().any(|m| m == "etc"), "missing: {missing:?}");
        }
        other => panic!("expected MissingSkeleton, got {other:?}"),
    }

    assert!(env.build_root.exists(), "failed root is kept for inspection");
    assert!(!lock_path(&env.build_root).exists());
    assert!(!scratch_of(&env.build_root).exists());
}

#[test]
fn test_cancelled_build_stops_before_first_stage() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(tarball(create_mock_minirootfs)));
    let cancel = CancelToken::new();
    let pipeline = env
        .pipeline(config, Arc::clone(&transport), Arc::new(FakeRunner::new(RUNTIME_VERSION)))
        .with_cancel_token(cancel.clone());

    cancel.cancel();
    assert!(pipeline.cancel_token().is_cancelled());
    let failure = pipeline.run().unwrap_err();

    assert_eq!(failure.stage, Stage::LoadConfig);
    assert!(matches!(failure.source, BuildError::Stage(StageError::Cancelled)));
    assert_eq!(transport.total_downloads(), 0);
    assert!(!env.build_root.exists());
}

#[test]
fn test_locked_build_root_is_refused() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(tarball(create_mock_minirootfs)));
    let pipeline = env.pipeline(config, Arc::clone(&transport), Arc::new(FakeRunner::new(RUNTIME_VERSION)));

    let held = BuildRootLock::acquire(&env.build_root).unwrap();
    let failure = pipeline.run().unwrap_err();

    assert_eq!(failure.stage, Stage::PrepareBuildRoot);
    match failure.source {
        BuildError::Environment(EnvironmentError::BuildRootLocked { holder, .. }) => {
            assert_eq!(holder, Some(std::process::id()));
        }
        other => panic!("expected BuildRootLocked, got {other:?}"),
    }
    assert_eq!(transport.total_downloads(), 0);

    drop(held);
    assert!(!lock_path(&env.build_root).exists());
}

#[test]
fn test_runtime_version_mismatch_fails_verification() {
    let env = TestEnv::new();
    let config = env.config();
    let transport = Arc::new(serving_transport(tarball(create_mock_minirootfs)));
    let pipeline = env.pipeline(config, transport, Arc::new(FakeRunner::new("v1.27.9+k3s1")));

    let failure = pipeline.run().unwrap_err();
    assert_eq!(failure.stage, Stage::VerifyBuild);
    match failure.source {
        BuildError::Stage(StageError::RuntimeVersionMismatch { expected, actual }) => {
            assert_eq!(expected, RUNTIME_VERSION);
            assert_eq!(actual, "v1.27.9+k3s1");
        }
        other => panic!("expected RuntimeVersionMismatch, got {other:?}"),
    }
    assert!(env.build_root.join("usr/local/bin/k3s").exists());
    assert!(!lock_path(&env.build_root).exists());
}

#[test]
fn test_host_context_skips_in_root_operations_without_side_effects() {
    let env = TestEnv::new();
    let root = env.base_dir.join("tree");
    create_mock_minirootfs(&root);
    let before = hash_tree(&root).unwrap();

    let runner = Arc::new(FakeRunner::new(RUNTIME_VERSION));
    let executor = Executor::new(ExecutionContext::Host, &root, runner.clone());
    let outcome = executor
        .run(&Operation::in_root("apk", ["add", "--no-cache", "openrc"]))
        .unwrap();

    assert!(matches!(outcome, Outcome::Skipped));
    assert!(runner.commands().is_empty());
    assert_eq!(hash_tree(&root).unwrap(), before);

    // Host-scoped operations still run
    let outcome = executor.run(&Operation::host("true", Vec::<String>::new())).unwrap();
    assert!(!outcome.was_skipped());
    assert_eq!(runner.commands(), ["true"]);
}
