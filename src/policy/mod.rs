//! Scaling policy: maps CPU utilization to a target worker count.
//!
//! Pure and total. Utilization at or below 10% keeps a single worker alive;
//! above that the target grows by one worker per 10 points of utilization,
//! clamped to the configured ceiling.

/// Computes the target worker count for a CPU utilization percentage.
///
/// The pool never scales to zero: the minimum target is 1. Non-finite and
/// negative samples (possible with bursty sampling backends) also map to 1.
/// `max_workers` caps the result so a burst above 100% cannot over-provision
/// the host.
pub fn target_count(cpu_percent: f64, max_workers: usize) -> usize {
    debug_assert!(max_workers > 0);

    if !cpu_percent.is_finite() || cpu_percent <= 10.0 {
        return 1;
    }

    let target = (cpu_percent / 10.0).floor() as usize;
    target.clamp(1, max_workers)
}
