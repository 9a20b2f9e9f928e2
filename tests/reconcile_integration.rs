//! End-to-end reconciliation tests over the in-memory doubles.
//!
//! Exercises the full lifecycle the binary drives against real
//! collaborators: bootstrap, CPU-driven scaling cycles, failure recovery,
//! and teardown.

use std::sync::Arc;
use std::time::Duration;

use proxyscale::config::ScalerConfig;
use proxyscale::driver::InMemoryDriver;
use proxyscale::policy;
use proxyscale::proxy::InMemoryProxy;
use proxyscale::reconciler::Reconciler;

fn test_config() -> ScalerConfig {
    ScalerConfig::default().with_drain_wait(Duration::from_millis(0))
}

fn fixture() -> (
    Reconciler<InMemoryDriver, InMemoryProxy>,
    Arc<InMemoryDriver>,
    Arc<InMemoryProxy>,
) {
    let driver = Arc::new(InMemoryDriver::new(5000));
    let proxy = Arc::new(InMemoryProxy::new());
    let reconciler = Reconciler::new(Arc::clone(&driver), Arc::clone(&proxy), test_config());
    (reconciler, driver, proxy)
}

fn expected_members(count: usize) -> Vec<String> {
    let mut names: Vec<String> = (0..count).map(|i| format!("server{i}")).collect();
    names.sort();
    names
}

/// After any successful cycle, worker ordinals and member names must both
/// be exactly `{0..target-1}`.
fn assert_converged(driver: &InMemoryDriver, proxy: &InMemoryProxy, target: usize) {
    assert_eq!(driver.live_ordinals(), (0..target).collect::<Vec<_>>());
    assert_eq!(proxy.committed_members(), expected_members(target));
}

#[tokio::test]
async fn full_lifecycle_follows_cpu_load() {
    let (reconciler, driver, proxy) = fixture();
    let config = test_config();

    reconciler.bootstrap().await.unwrap();
    assert_converged(&driver, &proxy, 1);
    assert_eq!(proxy.committed_backends(), vec!["server_backend"]);
    assert_eq!(proxy.committed_frontends(), vec!["server_frontend"]);

    // Load climbs, the pool follows.
    for (cpu, expected) in [(35.0, 3), (72.5, 7), (100.0, 10)] {
        let target = policy::target_count(cpu, config.max_workers);
        assert_eq!(target, expected);
        reconciler.reconcile(target).await.unwrap();
        assert_converged(&driver, &proxy, expected);
    }

    // Load falls back to idle.
    let target = policy::target_count(4.2, config.max_workers);
    assert_eq!(target, 1);
    reconciler.reconcile(target).await.unwrap();
    assert_converged(&driver, &proxy, 1);

    reconciler.teardown().await.unwrap();
    assert!(driver.live_ordinals().is_empty());
    assert!(proxy.committed_members().is_empty());
}

#[tokio::test]
async fn burst_above_full_utilization_is_capped() {
    let (reconciler, driver, proxy) = fixture();
    let config = test_config();

    let target = policy::target_count(340.0, config.max_workers);
    assert_eq!(target, config.max_workers);

    reconciler.reconcile(target).await.unwrap();
    assert_converged(&driver, &proxy, config.max_workers);
}

#[tokio::test]
async fn failed_commit_mid_sequence_heals_on_next_cycle() {
    let (reconciler, driver, proxy) = fixture();

    reconciler.reconcile(2).await.unwrap();
    assert_converged(&driver, &proxy, 2);

    // The scale-up to 6 starts its workers but the apply is rejected.
    proxy.fail_next_commit();
    reconciler.reconcile(6).await.unwrap_err();
    assert_eq!(driver.live_ordinals(), (0..6).collect::<Vec<_>>());
    assert_eq!(proxy.committed_members(), expected_members(2));

    // The next cycle sees six live workers, registers the missing four
    // members, and starts nothing new.
    let starts_before = driver.started().len();
    reconciler.reconcile(6).await.unwrap();
    assert_converged(&driver, &proxy, 6);
    assert_eq!(driver.started().len(), starts_before);
}

#[tokio::test]
async fn competing_committer_does_not_block_convergence() {
    let (reconciler, driver, proxy) = fixture();

    // Two cycles in a row race against another actor's commit.
    proxy.inject_stale_begins(1);
    reconciler.reconcile(3).await.unwrap();
    assert_converged(&driver, &proxy, 3);

    proxy.inject_stale_begins(1);
    reconciler.reconcile(1).await.unwrap();
    assert_converged(&driver, &proxy, 1);
}

#[tokio::test]
async fn scale_down_drains_before_killing() {
    let (reconciler, driver, proxy) = fixture();

    reconciler.reconcile(4).await.unwrap();
    reconciler.reconcile(1).await.unwrap();

    // Highest ordinals go first, and the member removals were committed in
    // the same cycle.
    assert_eq!(driver.stopped(), vec![3, 2, 1]);
    assert_converged(&driver, &proxy, 1);
    assert_eq!(driver.prunes(), 1);
}
