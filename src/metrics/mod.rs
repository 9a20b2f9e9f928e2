//! Host CPU utilization sampling.
//!
//! The control loop only needs one scalar per cycle: the percentage of CPU
//! in use across all cores, averaged over a short trailing window.

use async_trait::async_trait;
use sysinfo::{CpuRefreshKind, RefreshKind, System, MINIMUM_CPU_UPDATE_INTERVAL};

/// Source of the CPU utilization scalar driving the scaling policy.
#[async_trait]
pub trait MetricSource: Send {
    /// Returns host CPU utilization as a percentage in [0, 100].
    async fn sample(&mut self) -> f64;
}

/// Samples host CPU utilization via sysinfo.
///
/// sysinfo computes usage as a delta between two refreshes, so each sample
/// refreshes, waits the minimum update interval, and refreshes again.
pub struct CpuSampler {
    system: System,
}

impl CpuSampler {
    /// Creates a sampler with CPU-only refresh tracking.
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        Self { system }
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricSource for CpuSampler {
    async fn sample(&mut self) -> f64 {
        self.system.refresh_cpu_usage();
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        self.system.refresh_cpu_usage();
        f64::from(self.system.global_cpu_usage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sample_is_a_percentage() {
        let mut sampler = CpuSampler::new();
        let cpu = sampler.sample().await;
        assert!(cpu.is_finite());
        assert!(cpu >= 0.0);
        // Allow slight overshoot some platforms report under load.
        assert!(cpu <= 400.0, "implausible utilization: {cpu}");
    }
}
