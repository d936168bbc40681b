//! Booting the runtime inside an unpacked root, with node polls answered by
//! a recording command runner.

mod helpers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use helpers::*;
use rootsmith::validate::{run_functional, FunctionalOutcome};

const NOT_READY: &str = "edge   NotReady   control-plane,master   5s    v1.28.4+k3s1\n";
const READY: &str = "edge   Ready      control-plane,master   12s   v1.28.4+k3s1\n";

fn unpacked_root(env: &TestEnv) -> PathBuf {
    let root = env.base_dir.join("unpacked");
    create_mock_minirootfs(&root);
    root
}

#[test]
fn test_node_ready_after_not_ready_poll() {
    let env = TestEnv::new();
    let root = unpacked_root(&env);
    let runner = Arc::new(FakeRunner::new(RUNTIME_VERSION).with_node_listings([NOT_READY, READY]));

    let outcome = run_functional(&root, runner.clone(), Duration::from_secs(10), Duration::from_millis(1));
    assert_eq!(
        outcome,
        FunctionalOutcome::Ready {
            polls: 2,
            node: "edge".to_string()
        }
    );

    let root = root.display().to_string();
    let mounted = runner.position(&format!("mount -t proc proc {root}/proc")).expect("proc mounted");
    let started = runner
        .position(&format!("chroot {root} /usr/local/bin/k3s server"))
        .expect("server spawned through the runner");
    let polled = runner.position(&format!("chroot {root} /usr/local/bin/k3s kubectl get nodes")).unwrap();
    let released = runner.position("umount").expect("mounts released");
    assert!(mounted < started && started < polled && polled < released);

    assert_eq!(runner.stopped(), 1);
    assert!(runner.mounts.mounted().is_empty());
}

#[test]
fn test_node_never_ready_times_out() {
    let env = TestEnv::new();
    let root = unpacked_root(&env);
    let runner = Arc::new(FakeRunner::new(RUNTIME_VERSION).with_node_listings([NOT_READY]));

    let outcome = run_functional(&root, runner.clone(), Duration::from_millis(60), Duration::from_millis(10));
    let FunctionalOutcome::TimedOut { polls, .. } = outcome else {
        panic!("expected TimedOut, got {outcome:?}");
    };
    assert!(polls >= 1);
    let node_polls = runner.commands().iter().filter(|c| c.contains("kubectl get nodes")).count();
    assert_eq!(node_polls, polls as usize);

    assert_eq!(runner.stopped(), 1);
    assert!(runner.mounts.mounted().is_empty());
}
