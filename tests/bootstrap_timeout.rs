mod common;

use std::sync::atomic::Ordering;
use std::time::Instant;

use common::{FakeBackend, FakeBackendFactory, FakeCluster, FakeTunnels, FAST_WAIT};
use devspace::bootstrap::{BootstrapErrorKind, BootstrapManager, BootstrapOptions, BootstrapStage};

fn options() -> BootstrapOptions {
    let mut opts = BootstrapOptions::new("dev");
    opts.wait = FAST_WAIT;
    opts
}

#[test]
fn test_backend_never_ready_times_out() {
    let cluster = FakeCluster::never_ready();
    let tunnels = FakeTunnels::new();
    let factory = FakeBackendFactory::new(FakeBackend::new(cluster.clone()));
    let mgr = BootstrapManager::new(cluster.clone(), tunnels.clone(), factory.clone(), options());

    let started = Instant::now();
    let err = mgr.ensure_ready(false).expect_err("must time out");
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert!(err.is_timeout(), "{err}");
    assert_eq!(err.stage, BootstrapStage::ReplicasPending);
    assert!(err.to_string().contains("0/1 replicas ready"), "{err}");
    assert!(mgr.connection().is_none());
    let state = mgr.failed_state().expect("failed state kept");
    assert_eq!(state.stage(), BootstrapStage::ReplicasPending);
    let last = state
        .last_error(BootstrapStage::ReplicasPending)
        .expect("rollout error recorded");
    assert!(last.contains("0/1 replicas ready"), "{last}");
    assert_eq!(tunnels.opens.load(Ordering::SeqCst), 0);
    assert_eq!(factory.connect_count(), 0);

    // The outcome is cached: no second install attempt, same error
    let applied = cluster.applied_kinds().len();
    let again = mgr.ensure_ready(false).expect_err("still failed");
    assert_eq!(again, err);
    assert_eq!(cluster.applied_kinds().len(), applied);
}

#[test]
fn test_tunnel_failure_times_out_at_tunnel_stage() {
    let cluster = FakeCluster::with_backend("dev");
    let tunnels = FakeTunnels::failing();
    let factory = FakeBackendFactory::new(FakeBackend::new(cluster.clone()));
    let mgr = BootstrapManager::new(cluster, tunnels.clone(), factory.clone(), options());

    let err = mgr.ensure_ready(false).expect_err("must time out");
    assert!(err.is_timeout());
    assert_eq!(err.stage, BootstrapStage::TunnelEstablished);
    assert!(err.to_string().contains("connection refused"), "{err}");
    assert!(tunnels.opens.load(Ordering::SeqCst) > 1, "tunnel must be retried");
    assert_eq!(factory.connect_count(), 0);
    let state = mgr.failed_state().expect("failed state kept");
    assert!(state
        .last_error(BootstrapStage::TunnelEstablished)
        .is_some_and(|e| e.contains("connection refused")));
    assert_eq!(state.last_error(BootstrapStage::ReplicasPending), None);
}

#[test]
fn test_cancel_interrupts_wait() {
    let cluster = FakeCluster::never_ready();
    let factory = FakeBackendFactory::new(FakeBackend::new(cluster.clone()));
    let mut opts = options();
    opts.wait = devspace::WaitPolicy::new(
        std::time::Duration::from_millis(50),
        std::time::Duration::from_secs(60),
    );
    let mgr = BootstrapManager::new(cluster, FakeTunnels::new(), factory, opts);
    let token = mgr.cancel_token();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(100));
        token.cancel();
    });

    let started = Instant::now();
    let err = mgr.ensure_ready(false).expect_err("must be cancelled");
    canceller.join().unwrap();
    assert_eq!(err.kind, BootstrapErrorKind::Cancelled);
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}
