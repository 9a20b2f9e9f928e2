//! Timer-driven control loop.
//!
//! Ties the metric source, the scaling policy, and the reconciler together:
//! every interval, sample CPU utilization, derive the target worker count,
//! and run one reconciliation cycle. Strictly sequential — the next tick is
//! not processed until the previous cycle returns, so no two reconciliations
//! ever overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::ScalerConfig;
use crate::driver::WorkerPoolDriver;
use crate::metrics::MetricSource;
use crate::policy;
use crate::proxy::ProxyClient;
use crate::reconciler::Reconciler;

/// Number of sampling intervals the loop pauses after a failure streak.
const COOL_OFF_INTERVALS: u32 = 6;

/// The autoscaling control loop.
pub struct ControlLoop<D, P, M> {
    reconciler: Reconciler<D, P>,
    metrics: M,
    config: ScalerConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl<D, P, M> ControlLoop<D, P, M>
where
    D: WorkerPoolDriver,
    P: ProxyClient,
    M: MetricSource,
{
    pub fn new(
        driver: Arc<D>,
        proxy: Arc<P>,
        metrics: M,
        config: ScalerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            reconciler: Reconciler::new(driver, proxy, config.clone()),
            metrics,
            config,
            shutdown_tx,
        }
    }

    /// Handle for requesting a clean stop; the loop exits between cycles.
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Borrow of the underlying reconciler (for bootstrap before `run`).
    pub fn reconciler(&self) -> &Reconciler<D, P> {
        &self.reconciler
    }

    /// Runs the loop until a shutdown signal arrives.
    ///
    /// Cycle failures are logged and counted; after
    /// `max_consecutive_failures` in a row the loop pauses for a cool-off
    /// period before trying again. A successful cycle resets the count.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.sample_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut consecutive_failures = 0u32;

        info!(
            interval_secs = self.config.sample_interval.as_secs(),
            max_workers = self.config.max_workers,
            "Control loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Control loop received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    let cpu = self.metrics.sample().await;
                    let target = policy::target_count(cpu, self.config.max_workers);

                    match self.reconciler.reconcile(target).await {
                        Ok(()) => {
                            consecutive_failures = 0;
                            info!(
                                cpu = format_args!("{cpu:.1}"),
                                target,
                                "Reconciliation cycle complete"
                            );
                        }
                        Err(err) => {
                            consecutive_failures += 1;
                            warn!(
                                cpu = format_args!("{cpu:.1}"),
                                target,
                                failures = consecutive_failures,
                                error = %err,
                                "Reconciliation cycle failed"
                            );

                            if consecutive_failures >= self.config.max_consecutive_failures {
                                let cool_off = self.cool_off_period();
                                error!(
                                    failures = consecutive_failures,
                                    pause_secs = cool_off.as_secs(),
                                    "Sustained reconciliation failure, pausing the loop"
                                );
                                tokio::select! {
                                    _ = shutdown_rx.recv() => {
                                        info!("Control loop received shutdown signal");
                                        break;
                                    }
                                    _ = tokio::time::sleep(cool_off) => {}
                                }
                                consecutive_failures = 0;
                            }
                        }
                    }
                }
            }
        }

        info!("Control loop stopped");
    }

    fn cool_off_period(&self) -> Duration {
        self.config.sample_interval * COOL_OFF_INTERVALS
    }
}
