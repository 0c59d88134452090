//! Metrics collection for backup and restore runs
//!
//! Provides Prometheus-compatible metrics for monitoring run outcomes,
//! artifact sizes and retention activity.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    /// Counter for finished backup runs
    static ref BACKUP_RUNS: IntCounterVec = register_int_counter_vec!(
        "tablevault_backup_runs_total",
        "Total number of finished backup runs",
        &["policy", "status"]
    ).unwrap();

    /// Counter for finished restore runs
    static ref RESTORE_RUNS: IntCounterVec = register_int_counter_vec!(
        "tablevault_restore_runs_total",
        "Total number of finished restore runs",
        &["status"]
    ).unwrap();

    /// Histogram for run duration
    static ref RUN_DURATION: HistogramVec = register_histogram_vec!(
        "tablevault_run_duration_seconds",
        "Run duration in seconds",
        &["operation"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]
    ).unwrap();

    /// Counter for bytes written to the artifact store
    static ref ARTIFACT_BYTES: IntCounter = register_int_counter!(
        "tablevault_artifact_bytes_total",
        "Total bytes written to the artifact store"
    ).unwrap();

    /// Counter for runs deleted by the retention sweep
    static ref RETENTION_DELETIONS: IntCounterVec = register_int_counter_vec!(
        "tablevault_retention_deletions_total",
        "Backup runs removed by the retention sweep",
        &["outcome"]
    ).unwrap();

    /// Counter for triggers skipped because a run was already in progress
    static ref SKIPPED_OVERLAPPING: IntCounterVec = register_int_counter_vec!(
        "tablevault_skipped_overlapping_runs_total",
        "Backup triggers skipped because a run was in progress",
        &["policy"]
    ).unwrap();

    /// Gauge for in-flight runs
    static ref ACTIVE_RUNS: IntGauge = register_int_gauge!(
        "tablevault_active_runs",
        "Number of backup and restore runs currently in progress"
    ).unwrap();
}

/// Holds a gauge incremented for as long as the guard lives
pub struct GaugeGuard {
    gauge: IntGauge,
}

impl GaugeGuard {
    pub fn new(gauge: IntGauge) -> Self {
        gauge.inc();
        Self { gauge }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Count a run as active until the returned guard is dropped
pub fn track_active_run() -> GaugeGuard {
    GaugeGuard::new(ACTIVE_RUNS.clone())
}

/// Record a finished backup run
pub fn record_backup(policy_id: &str, status: &str, duration: f64, bytes: u64) {
    BACKUP_RUNS.with_label_values(&[policy_id, status]).inc();
    RUN_DURATION.with_label_values(&["backup"]).observe(duration);
    ARTIFACT_BYTES.inc_by(bytes);
}

/// Record a finished restore run
pub fn record_restore(status: &str, duration: f64) {
    RESTORE_RUNS.with_label_values(&[status]).inc();
    RUN_DURATION.with_label_values(&["restore"]).observe(duration);
}

/// Record retention sweep results
pub fn record_retention(deleted: usize, failed: usize) {
    RETENTION_DELETIONS
        .with_label_values(&["deleted"])
        .inc_by(deleted as u64);
    RETENTION_DELETIONS
        .with_label_values(&["failed"])
        .inc_by(failed as u64);
}

/// Record a skipped overlapping trigger
pub fn record_skipped_overlap(policy_id: &str) {
    SKIPPED_OVERLAPPING.with_label_values(&[policy_id]).inc();
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer
    #[inline]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in seconds
    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        drop(track_active_run());
        record_backup("metrics-test", "success", 0.2, 128);
        record_skipped_overlap("metrics-test");
        record_retention(1, 0);

        let text = gather_text();
        assert!(text.contains("tablevault_backup_runs_total"));
        assert!(text.contains("tablevault_skipped_overlapping_runs_total"));
        assert!(text.contains("tablevault_retention_deletions_total"));
    }

    #[test]
    fn test_gauge_guard_decrements_on_every_exit() {
        let gauge = IntGauge::new("test_active", "test gauge").unwrap();

        fn fails_midway(gauge: &IntGauge) -> Result<(), String> {
            let _guard = GaugeGuard::new(gauge.clone());
            assert_eq!(gauge.get(), 1);
            Err::<(), String>("ledger unavailable".to_string())?;
            Ok(())
        }

        assert!(fails_midway(&gauge).is_err());
        assert_eq!(gauge.get(), 0);

        {
            let _a = GaugeGuard::new(gauge.clone());
            let _b = GaugeGuard::new(gauge.clone());
            assert_eq!(gauge.get(), 2);
        }
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start();
        assert!(timer.elapsed_secs() >= 0.0);
    }
}
