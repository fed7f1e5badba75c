//! Observability infrastructure for the fleet daemon
//!
//! Provides:
//! - Prometheus metrics (reconciliation rounds, backoff, consolidation latency, history commits)
//! - Structured JSON logging with tracing

use crate::models::{Instance, UsageSnapshot};
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter,
    IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for consolidation tick latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<FleetMetricsInner> = OnceLock::new();

struct FleetMetricsInner {
    reconcile_rounds: IntCounter,
    reconcile_errors: IntCounter,
    reconcile_backoff_seconds: IntGauge,
    instances_managed: IntGauge,
    instances_provisioned: IntCounter,
    consolidation_latency_seconds: Histogram,
    history_commits: IntCounter,
    history_commit_errors: IntCounter,
    snapshots_out_of_date: IntGauge,
}

impl FleetMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_rounds: register_int_counter!(
                "fleet_reconcile_rounds_total",
                "Total number of fleet reconciliation rounds"
            )
            .expect("Failed to register reconcile_rounds"),

            reconcile_errors: register_int_counter!(
                "fleet_reconcile_errors_total",
                "Total number of reconciliation rounds that recorded an error"
            )
            .expect("Failed to register reconcile_errors"),

            reconcile_backoff_seconds: register_int_gauge!(
                "fleet_reconcile_backoff_seconds",
                "Extra delay currently applied before the next reconciliation round"
            )
            .expect("Failed to register reconcile_backoff_seconds"),

            instances_managed: register_int_gauge!(
                "fleet_instances_managed",
                "Number of monitoring instances in the registry"
            )
            .expect("Failed to register instances_managed"),

            instances_provisioned: register_int_counter!(
                "fleet_instances_provisioned_total",
                "Total number of monitoring instances provisioned"
            )
            .expect("Failed to register instances_provisioned"),

            consolidation_latency_seconds: register_histogram!(
                "fleet_consolidation_latency_seconds",
                "Time spent in one consolidation tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register consolidation_latency_seconds"),

            history_commits: register_int_counter!(
                "fleet_history_commits_total",
                "Total number of snapshots committed to history"
            )
            .expect("Failed to register history_commits"),

            history_commit_errors: register_int_counter!(
                "fleet_history_commit_errors_total",
                "Total number of failed history commits"
            )
            .expect("Failed to register history_commit_errors"),

            snapshots_out_of_date: register_int_gauge!(
                "fleet_snapshots_out_of_date",
                "Number of clusters whose latest snapshot was out of date"
            )
            .expect("Failed to register snapshots_out_of_date"),
        }
    }
}

/// Fleet metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct FleetMetrics {
    _private: (),
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &FleetMetricsInner {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new)
    }

    pub fn inc_reconcile_rounds(&self) {
        self.inner().reconcile_rounds.inc();
    }

    pub fn inc_reconcile_errors(&self) {
        self.inner().reconcile_errors.inc();
    }

    pub fn set_backoff_seconds(&self, secs: u64) {
        self.inner()
            .reconcile_backoff_seconds
            .set(secs.min(i64::MAX as u64) as i64);
    }

    pub fn set_instances_managed(&self, count: usize) {
        self.inner().instances_managed.set(count as i64);
    }

    pub fn inc_instances_provisioned(&self) {
        self.inner().instances_provisioned.inc();
    }

    pub fn observe_consolidation_latency(&self, duration_secs: f64) {
        self.inner()
            .consolidation_latency_seconds
            .observe(duration_secs);
    }

    pub fn inc_history_commits(&self) {
        self.inner().history_commits.inc();
    }

    pub fn inc_history_commit_errors(&self) {
        self.inner().history_commit_errors.inc();
    }

    pub fn set_snapshots_out_of_date(&self, count: usize) {
        self.inner().snapshots_out_of_date.set(count as i64);
    }
}

/// Structured logger for fleet events
///
/// Provides consistent JSON-formatted records for provisioning, repair and
/// consolidation events.
#[derive(Clone)]
pub struct StructuredLogger {
    daemon: String,
}

impl StructuredLogger {
    pub fn new(daemon: impl Into<String>) -> Self {
        Self {
            daemon: daemon.into(),
        }
    }

    /// Log daemon startup
    pub fn log_startup(&self, version: &str, data_dir: &str) {
        info!(
            event = "daemon_started",
            daemon = %self.daemon,
            version = %version,
            data_dir = %data_dir,
            "Fleet daemon started"
        );
    }

    /// Log daemon shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            daemon = %self.daemon,
            reason = %reason,
            "Fleet daemon shutting down"
        );
    }

    /// Log a newly provisioned monitoring instance
    pub fn log_instance_provisioned(&self, instance: &Instance) {
        info!(
            event = "instance_provisioned",
            daemon = %self.daemon,
            cluster = %instance.cluster_name,
            instance = %instance.name,
            instance_id = %instance.id,
            host_port = instance.host_port,
            auth_type = %instance.auth_type,
            "Provisioned monitoring instance"
        );
    }

    /// Log removal of a dead instance from the registry
    pub fn log_instance_deregistered(&self, instance: &Instance, state: &str) {
        warn!(
            event = "instance_deregistered",
            daemon = %self.daemon,
            cluster = %instance.cluster_name,
            instance = %instance.name,
            instance_id = %instance.id,
            runtime_state = %state,
            "Deregistered monitoring instance that is no longer running"
        );
    }

    /// Log a cluster left without an instance this round
    pub fn log_cluster_skipped(&self, cluster: &str, reason: &str) {
        warn!(
            event = "cluster_skipped",
            daemon = %self.daemon,
            cluster = %cluster,
            reason = %reason,
            "Skipping cluster"
        );
    }

    /// Log a snapshot held back from history
    pub fn log_snapshot_out_of_date(&self, snapshot: &UsageSnapshot) {
        info!(
            event = "snapshot_out_of_date",
            daemon = %self.daemon,
            cluster = %snapshot.cluster_name,
            cpu_non_allocatable = snapshot.cpu_non_allocatable,
            mem_non_allocatable = snapshot.mem_non_allocatable,
            "Usage snapshot out of date, not committed to history"
        );
    }

    /// Log the outcome of a reconciliation round
    pub fn log_round_result(&self, errors: usize, backoff_secs: u64) {
        if errors == 0 {
            info!(
                event = "reconcile_round",
                daemon = %self.daemon,
                errors = 0,
                "Reconciliation round complete"
            );
        } else {
            warn!(
                event = "reconcile_round",
                daemon = %self.daemon,
                errors = errors,
                backoff_secs = backoff_secs,
                "Reconciliation round recorded errors, backing off"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_metrics_creation() {
        let metrics = FleetMetrics::new();

        metrics.inc_reconcile_rounds();
        metrics.inc_reconcile_errors();
        metrics.set_backoff_seconds(3);
        metrics.set_instances_managed(2);
        metrics.observe_consolidation_latency(0.01);
        metrics.inc_history_commits();
        metrics.set_snapshots_out_of_date(1);

        // A second handle shares the global instance
        let other = FleetMetrics::default();
        other.inc_instances_provisioned();
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("fleet-daemon");
        assert_eq!(logger.daemon, "fleet-daemon");
    }
}
