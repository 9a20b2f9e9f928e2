//! Reconciliation engine.
//!
//! Each cycle re-derives state from the two external systems (the container
//! runtime and the proxy's configuration store), computes the delta against
//! the desired ordinal set `{0..target-1}`, and converges both sides inside
//! a single proxy transaction. Nothing is persisted between cycles, so
//! external interference (a killed container, a failed commit from a prior
//! cycle) is detected and repaired on the next pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ScalerConfig;
use crate::driver::{Worker, WorkerPoolDriver};
use crate::error::{ProxyError, ReconcileError};
use crate::proxy::{
    member_ordinal, BackendSpec, BindSpec, FrontendSpec, MemberSpec, ProxyClient, TransactionId,
};

/// Drives the worker pool and the proxy's backend member list toward a
/// target count.
pub struct Reconciler<D, P> {
    driver: Arc<D>,
    proxy: Arc<P>,
    config: ScalerConfig,
}

/// Delta between observed and desired state for one cycle.
#[derive(Debug, Default)]
struct CycleDelta {
    /// Desired ordinals with no live worker, ascending.
    missing_workers: Vec<usize>,
    /// Desired ordinals with no registered member, ascending.
    missing_members: Vec<usize>,
    /// Registered member ordinals at or above the target, descending.
    excess_members: Vec<usize>,
    /// Live worker ordinals at or above the target, descending.
    excess_workers: Vec<usize>,
}

impl CycleDelta {
    fn is_empty(&self) -> bool {
        self.missing_workers.is_empty()
            && self.missing_members.is_empty()
            && self.excess_members.is_empty()
            && self.excess_workers.is_empty()
    }
}

impl<D, P> Reconciler<D, P>
where
    D: WorkerPoolDriver,
    P: ProxyClient,
{
    pub fn new(driver: Arc<D>, proxy: Arc<P>, config: ScalerConfig) -> Self {
        Self {
            driver,
            proxy,
            config,
        }
    }

    /// Converges the pool and the backend member list on `target` workers.
    ///
    /// Stale-version conflicts are retried immediately from a fresh state
    /// read; transient proxy outages are retried after a backoff. Both are
    /// bounded by `stale_retry_attempts`. A failed worker launch or a failed
    /// commit aborts the cycle without retry — the next cycle's fresh read
    /// converges whatever state was left behind.
    pub async fn reconcile(&self, target: usize) -> Result<(), ReconcileError> {
        let max_attempts = self.config.stale_retry_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.converge(target).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let retryable = matches!(
                        err,
                        ReconcileError::Proxy(ProxyError::StaleVersion { .. })
                            | ReconcileError::Proxy(ProxyError::Unreachable(_))
                    );
                    if !retryable {
                        return Err(err);
                    }
                    if attempt >= max_attempts {
                        return Err(ReconcileError::RetriesExhausted {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    match err {
                        ReconcileError::Proxy(ProxyError::StaleVersion { .. }) => {
                            warn!(attempt, "Configuration version went stale, retrying from a fresh read");
                        }
                        _ => {
                            warn!(attempt, error = %err, "Proxy unreachable, backing off before retry");
                            tokio::time::sleep(self.config.transient_backoff).await;
                        }
                    }
                }
            }
        }
    }

    /// One full convergence pass: fresh reads, delta, one transaction.
    async fn converge(&self, target: usize) -> Result<(), ReconcileError> {
        let workers = self.driver.list().await?;
        let members = self
            .proxy
            .list_members(&self.config.backend_name)
            .await?;

        let live: BTreeMap<usize, Worker> =
            workers.into_iter().map(|w| (w.ordinal, w)).collect();
        let registered: BTreeSet<usize> =
            members.iter().filter_map(|name| member_ordinal(name)).collect();

        let delta = Self::delta(target, &live, &registered);
        if delta.is_empty() {
            debug!(target, "Pool already converged, no transaction opened");
            return Ok(());
        }

        info!(
            target,
            workers = live.len(),
            members = registered.len(),
            starting = delta.missing_workers.len(),
            registering = delta.missing_members.len(),
            removing = delta.excess_members.len(),
            stopping = delta.excess_workers.len(),
            "Reconciling pool"
        );

        // One transaction per cycle, opened against the version read now.
        let version = self.proxy.current_version().await?;
        let tx = self.proxy.begin_transaction(version).await?;

        // Scale-up side. A worker is always started before its member is
        // staged; a launch failure abandons the whole cycle so the proxy
        // never routes to a worker that does not exist.
        for &ordinal in &delta.missing_workers {
            let worker = match self.driver.start(ordinal).await {
                Ok(worker) => worker,
                Err(err) => {
                    self.abandon_quietly(&tx).await;
                    return Err(ReconcileError::ScaleUpFailed {
                        ordinal,
                        source: err,
                    });
                }
            };
            debug!(ordinal, port = worker.port, "Worker started");
        }

        let staging = self.stage_member_changes(&tx, &delta).await;
        if let Err(err) = staging {
            self.abandon_quietly(&tx).await;
            return Err(err);
        }

        self.proxy.commit(&tx).await?.ensure_success()?;

        // Member removals are durable now, so no new requests reach the
        // workers being retired. Give in-flight requests a drain window,
        // then kill from the highest ordinal down.
        if !delta.excess_workers.is_empty() {
            tokio::time::sleep(self.config.drain_wait).await;

            for ordinal in &delta.excess_workers {
                match live.get(ordinal) {
                    Some(worker) => self.driver.stop(worker).await?,
                    // Already gone, e.g. killed externally mid-cycle.
                    None => warn!(ordinal, "Worker vanished before it could be stopped"),
                }
            }

            if let Err(err) = self.driver.prune().await {
                warn!(error = %err, "Failed to prune stopped workers");
            }
        }

        Ok(())
    }

    /// Stages all member additions and removals for this cycle.
    async fn stage_member_changes(
        &self,
        tx: &TransactionId,
        delta: &CycleDelta,
    ) -> Result<(), ReconcileError> {
        for &ordinal in &delta.missing_members {
            let member = MemberSpec::for_worker(
                self.config.member_name(ordinal),
                self.config.port_for(ordinal),
                self.config.member_maxconn,
            );
            self.proxy
                .add_member(tx, &self.config.backend_name, &member)
                .await?;
        }

        for &ordinal in &delta.excess_members {
            self.proxy
                .remove_member(
                    tx,
                    &self.config.backend_name,
                    &self.config.member_name(ordinal),
                )
                .await?;
        }

        Ok(())
    }

    fn delta(
        target: usize,
        live: &BTreeMap<usize, Worker>,
        registered: &BTreeSet<usize>,
    ) -> CycleDelta {
        CycleDelta {
            missing_workers: (0..target).filter(|i| !live.contains_key(i)).collect(),
            missing_members: (0..target).filter(|i| !registered.contains(i)).collect(),
            excess_members: registered
                .iter()
                .copied()
                .filter(|&i| i >= target)
                .rev()
                .collect(),
            excess_workers: live
                .keys()
                .copied()
                .filter(|&i| i >= target)
                .rev()
                .collect(),
        }
    }

    /// Discards a transaction that will never be committed.
    async fn abandon_quietly(&self, tx: &TransactionId) {
        if let Err(err) = self.proxy.abandon(tx).await {
            warn!(transaction = %tx, error = %err, "Failed to abandon transaction");
        }
    }

    /// One-time startup: clears any leftover pool workers, then creates the
    /// backend, worker 0 with its member, the frontend, and the bind inside
    /// a single transaction. Any failure here is fatal to the process.
    pub async fn bootstrap(&self) -> Result<(), ReconcileError> {
        info!("Bootstrapping proxy configuration and worker pool");

        let leftovers = self.driver.list().await?;
        for worker in leftovers.iter().rev() {
            self.driver.stop(worker).await?;
        }
        if let Err(err) = self.driver.prune().await {
            warn!(error = %err, "Failed to prune leftover workers");
        }

        let version = self.proxy.current_version().await?;
        let tx = self.proxy.begin_transaction(version).await?;

        if let Err(err) = self.stage_bootstrap(&tx).await {
            self.abandon_quietly(&tx).await;
            return Err(err);
        }

        self.proxy
            .commit(&tx)
            .await?
            .ensure_success()
            .map_err(|err| ReconcileError::BootstrapFailed(err.to_string()))?;

        info!(
            backend = %self.config.backend_name,
            frontend = %self.config.frontend_name,
            bind_port = self.config.bind_port,
            "Bootstrap transaction applied"
        );
        Ok(())
    }

    async fn stage_bootstrap(
        &self,
        tx: &TransactionId,
    ) -> Result<(), ReconcileError> {
        self.proxy
            .create_backend(tx, &BackendSpec::round_robin(&self.config.backend_name))
            .await?;

        let worker = self
            .driver
            .start(0)
            .await
            .map_err(|err| ReconcileError::ScaleUpFailed {
                ordinal: 0,
                source: err,
            })?;
        self.proxy
            .add_member(
                tx,
                &self.config.backend_name,
                &MemberSpec::for_worker(
                    self.config.member_name(0),
                    worker.port,
                    self.config.member_maxconn,
                ),
            )
            .await?;

        self.proxy
            .create_frontend(
                tx,
                &FrontendSpec {
                    name: self.config.frontend_name.clone(),
                    default_backend: self.config.backend_name.clone(),
                    maxconn: self.config.frontend_maxconn,
                    stats_uri_prefix: self.config.stats_uri_prefix.clone(),
                },
            )
            .await?;

        self.proxy
            .create_bind(
                tx,
                &self.config.frontend_name,
                &BindSpec::http(self.config.bind_port),
            )
            .await?;

        Ok(())
    }

    /// Removes every member and stops every worker. Used by the `teardown`
    /// command to leave the host clean.
    pub async fn teardown(&self) -> Result<(), ReconcileError> {
        let members = self
            .proxy
            .list_members(&self.config.backend_name)
            .await?;

        if !members.is_empty() {
            let version = self.proxy.current_version().await?;
            let tx = self.proxy.begin_transaction(version).await?;
            for name in members.iter().rev() {
                self.proxy
                    .remove_member(&tx, &self.config.backend_name, name)
                    .await?;
            }
            self.proxy.commit(&tx).await?.ensure_success()?;
        }

        let workers = self.driver.list().await?;
        for worker in workers.iter().rev() {
            self.driver.stop(worker).await?;
        }
        if let Err(err) = self.driver.prune().await {
            warn!(error = %err, "Failed to prune stopped workers");
        }

        info!(members = members.len(), "Teardown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::InMemoryDriver;
    use crate::proxy::{InMemoryProxy, ProxyClient};
    use std::time::Duration;

    fn test_config() -> ScalerConfig {
        ScalerConfig::default()
            .with_drain_wait(Duration::from_millis(0))
    }

    /// Builds a reconciler over fresh in-memory doubles with `count` workers
    /// live and registered.
    async fn converged_fixture(
        count: usize,
    ) -> (
        Reconciler<InMemoryDriver, InMemoryProxy>,
        Arc<InMemoryDriver>,
        Arc<InMemoryProxy>,
    ) {
        let driver = Arc::new(InMemoryDriver::new(5000));
        let proxy = Arc::new(InMemoryProxy::new());
        driver.seed(count);

        if count > 0 {
            let version = proxy.current_version().await.unwrap();
            let tx = proxy.begin_transaction(version).await.unwrap();
            for i in 0..count {
                proxy
                    .add_member(
                        &tx,
                        "server_backend",
                        &MemberSpec::for_worker(format!("server{i}"), 5000 + i as u16, 30),
                    )
                    .await
                    .unwrap();
            }
            proxy.commit(&tx).await.unwrap().ensure_success().unwrap();
        }

        let reconciler = Reconciler::new(Arc::clone(&driver), Arc::clone(&proxy), test_config());
        (reconciler, driver, proxy)
    }

    fn member_names(count: usize) -> Vec<String> {
        let mut names: Vec<String> = (0..count).map(|i| format!("server{i}")).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_scale_up_starts_and_registers_new_ordinals() {
        let (reconciler, driver, proxy) = converged_fixture(2).await;
        let begins_before = proxy.counters().begins;

        reconciler.reconcile(5).await.unwrap();

        assert_eq!(driver.started(), vec![2, 3, 4]);
        assert!(driver.stopped().is_empty());
        assert_eq!(driver.live_ordinals(), vec![0, 1, 2, 3, 4]);
        assert_eq!(proxy.committed_members(), member_names(5));

        let counters = proxy.counters();
        assert_eq!(counters.begins - begins_before, 1);
        assert_eq!(counters.commits, 2); // fixture seed + this cycle
        assert_eq!(counters.member_adds, 5);
        assert_eq!(counters.member_removes, 0);
    }

    #[tokio::test]
    async fn test_scale_down_removes_then_stops_highest_first() {
        let (reconciler, driver, proxy) = converged_fixture(5).await;

        reconciler.reconcile(2).await.unwrap();

        assert_eq!(driver.stopped(), vec![4, 3, 2]);
        assert!(driver.started().is_empty());
        assert_eq!(driver.live_ordinals(), vec![0, 1]);
        assert_eq!(proxy.committed_members(), member_names(2));
        assert_eq!(driver.prunes(), 1);
        assert_eq!(proxy.counters().member_removes, 3);
        assert_eq!(proxy.counters().commits, 2);
    }

    #[tokio::test]
    async fn test_converged_pool_is_a_no_op() {
        let (reconciler, driver, proxy) = converged_fixture(3).await;
        let counters_before = proxy.counters();

        reconciler.reconcile(3).await.unwrap();

        assert_eq!(proxy.counters(), counters_before);
        assert!(driver.started().is_empty());
        assert!(driver.stopped().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (reconciler, driver, proxy) = converged_fixture(1).await;

        reconciler.reconcile(4).await.unwrap();
        let counters_after_first = proxy.counters();
        let started_after_first = driver.started();

        reconciler.reconcile(4).await.unwrap();

        assert_eq!(proxy.counters(), counters_after_first);
        assert_eq!(driver.started(), started_after_first);
        assert_eq!(driver.live_ordinals(), vec![0, 1, 2, 3]);
        assert_eq!(proxy.committed_members(), member_names(4));
    }

    #[tokio::test]
    async fn test_commit_failure_then_recovery_reregisters_without_restart() {
        let (reconciler, driver, proxy) = converged_fixture(2).await;
        proxy.fail_next_commit();

        let err = reconciler.reconcile(4).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Proxy(ProxyError::CommitFailed(_))
        ));

        // Workers 2 and 3 are running but unregistered.
        assert_eq!(driver.live_ordinals(), vec![0, 1, 2, 3]);
        assert_eq!(proxy.committed_members(), member_names(2));
        let starts_after_failure = driver.started();

        reconciler.reconcile(4).await.unwrap();

        // Converged by re-registering, not by restarting.
        assert_eq!(driver.started(), starts_after_failure);
        assert_eq!(proxy.committed_members(), member_names(4));
        assert_eq!(driver.live_ordinals(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_launch_failure_abandons_transaction() {
        let (reconciler, driver, proxy) = converged_fixture(1).await;
        driver.fail_start_of(2);

        let err = reconciler.reconcile(3).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::ScaleUpFailed { ordinal: 2, .. }
        ));

        // No member was registered for anything this cycle and the
        // transaction was discarded.
        assert_eq!(proxy.committed_members(), member_names(1));
        assert_eq!(proxy.open_transactions(), 0);
        assert_eq!(proxy.counters().abandons, 1);
        assert_eq!(proxy.counters().commits, 1); // fixture seed only

        // Worker 1 did start before the failure; the next cycle registers
        // it and fills in ordinal 2.
        reconciler.reconcile(3).await.unwrap();
        assert_eq!(driver.live_ordinals(), vec![0, 1, 2]);
        assert_eq!(proxy.committed_members(), member_names(3));
    }

    #[tokio::test]
    async fn test_stale_version_is_retried_from_fresh_read() {
        let (reconciler, driver, proxy) = converged_fixture(1).await;
        proxy.inject_stale_begins(1);

        reconciler.reconcile(2).await.unwrap();

        assert_eq!(proxy.committed_members(), member_names(2));
        assert_eq!(driver.live_ordinals(), vec![0, 1]);
        // First begin failed stale, second succeeded.
        assert_eq!(proxy.counters().begins, 3); // fixture seed + 2 attempts
    }

    #[tokio::test]
    async fn test_persistent_stale_version_exhausts_retries() {
        let (reconciler, _driver, proxy) = converged_fixture(1).await;
        proxy.inject_stale_begins(10);

        let err = reconciler.reconcile(2).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_externally_killed_worker_is_replaced() {
        let (reconciler, driver, proxy) = converged_fixture(3).await;

        // Something outside the loop killed worker 1.
        let victim = Worker {
            ordinal: 1,
            id: "c2".to_string(),
            port: 5001,
        };
        driver.stop(&victim).await.unwrap();
        assert_eq!(driver.live_ordinals(), vec![0, 2]);

        reconciler.reconcile(3).await.unwrap();

        assert_eq!(driver.live_ordinals(), vec![0, 1, 2]);
        assert_eq!(proxy.committed_members(), member_names(3));
    }

    #[tokio::test]
    async fn test_bootstrap_creates_full_frontend_backend_pair() {
        let driver = Arc::new(InMemoryDriver::new(5000));
        let proxy = Arc::new(InMemoryProxy::new());
        driver.seed(2); // leftovers from a previous run

        let reconciler = Reconciler::new(Arc::clone(&driver), Arc::clone(&proxy), test_config());
        reconciler.bootstrap().await.unwrap();

        assert_eq!(proxy.committed_backends(), vec!["server_backend"]);
        assert_eq!(proxy.committed_frontends(), vec!["server_frontend"]);
        assert_eq!(
            proxy.committed_binds(),
            vec![("server_frontend".to_string(), 80)]
        );
        assert_eq!(proxy.committed_members(), member_names(1));
        // Leftovers were cleared before worker 0 was launched fresh.
        assert_eq!(driver.stopped(), vec![1, 0]);
        assert_eq!(driver.live_ordinals(), vec![0]);
        assert_eq!(proxy.counters().commits, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_commit_failure_is_fatal() {
        let driver = Arc::new(InMemoryDriver::new(5000));
        let proxy = Arc::new(InMemoryProxy::new());
        proxy.fail_next_commit();

        let reconciler = Reconciler::new(Arc::clone(&driver), Arc::clone(&proxy), test_config());
        let err = reconciler.bootstrap().await.unwrap_err();

        assert!(matches!(err, ReconcileError::BootstrapFailed(_)));
        assert!(proxy.committed_backends().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_clears_members_and_workers() {
        let (reconciler, driver, proxy) = converged_fixture(3).await;

        reconciler.teardown().await.unwrap();

        assert!(proxy.committed_members().is_empty());
        assert!(driver.live_ordinals().is_empty());
        assert_eq!(driver.stopped(), vec![2, 1, 0]);
    }
}
