//! Consolidation loop
//!
//! Once per tick every registered cluster gets a fresh snapshot. The whole
//! snapshot set is written to the current-usage file, and snapshots that pass
//! the freshness check are appended to the cluster's history archive as total
//! consumption (used plus non-allocatable).

use super::snapshot::ClusterUsageSnapshotter;
use crate::health::{components, HealthRegistry};
use crate::models::UsageSnapshot;
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::paths::FleetPaths;
use crate::persist::write_atomic;
use crate::registry::{InstanceRegistry, RegistryError};
use crate::tsdb::{Archive, TsdbError, DEFAULT_STEP_SECS};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Configuration for the consolidation loop
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Time between ticks (default: one archive step)
    pub interval: Duration,
    /// Step of the history archives and of the snapshot window
    pub step_secs: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_STEP_SECS),
            step_secs: DEFAULT_STEP_SECS,
        }
    }
}

/// Outcome of one consolidation tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub clusters: usize,
    pub committed: usize,
    pub out_of_date: usize,
    /// Appends rejected because history already holds this timestamp
    pub stale: usize,
    pub failed: usize,
    pub current_usage_written: bool,
}

pub struct ConsolidationLoop {
    paths: FleetPaths,
    snapshotter: ClusterUsageSnapshotter,
    config: ConsolidationConfig,
    metrics: FleetMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl ConsolidationLoop {
    pub fn new(
        paths: FleetPaths,
        snapshotter: ClusterUsageSnapshotter,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            paths,
            snapshotter,
            config,
            metrics: FleetMetrics::new(),
            logger: StructuredLogger::new("consolidator"),
            health: None,
        }
    }

    /// Report tick outcomes to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Run until a shutdown signal arrives. A tick in progress always completes.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            step_secs = self.config.step_secs,
            "Starting consolidation loop"
        );

        let this = Arc::new(self);
        let mut ticker = interval(this.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let result = this.clone().tick_blocking(Utc::now()).await;
                    this.metrics
                        .observe_consolidation_latency(start.elapsed().as_secs_f64());

                    match result {
                        Ok(report) => {
                            debug!(
                                clusters = report.clusters,
                                committed = report.committed,
                                out_of_date = report.out_of_date,
                                stale = report.stale,
                                failed = report.failed,
                                "Consolidation tick complete"
                            );
                            if let Some(health) = &this.health {
                                let failed = report.failed + usize::from(!report.current_usage_written);
                                health
                                    .report_tick(components::CONSOLIDATOR, failed, report.clusters.max(1))
                                    .await;
                            }
                        }
                        Err(e) => {
                            error!(error = %format!("{:#}", e), "Consolidation tick failed");
                            if let Some(health) = &this.health {
                                health
                                    .set_unhealthy(components::CONSOLIDATOR, format!("{:#}", e))
                                    .await;
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down consolidation loop");
                    break;
                }
            }
        }
    }

    /// Run [`tick`](Self::tick) on the blocking thread pool
    pub async fn tick_blocking(self: Arc<Self>, now: DateTime<Utc>) -> anyhow::Result<TickReport> {
        let report = tokio::task::spawn_blocking(move || self.tick(now))
            .await
            .context("Consolidation tick panicked")??;
        Ok(report)
    }

    /// Consolidate every registered cluster once.
    ///
    /// Only an unreadable registry fails the tick; per-cluster problems are
    /// logged and counted in the report.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, RegistryError> {
        let state = InstanceRegistry::read_state(&self.paths.registry_file())?;

        let snapshots: Vec<UsageSnapshot> = state
            .instances
            .iter()
            .map(|instance| {
                self.snapshotter.snapshot(
                    &instance.cluster_name,
                    Path::new(&instance.data_volume_path),
                    now,
                )
            })
            .collect();

        let mut report = TickReport {
            clusters: snapshots.len(),
            current_usage_written: self.write_current_usage(&snapshots),
            ..TickReport::default()
        };

        for snapshot in &snapshots {
            if snapshot.out_of_date {
                report.out_of_date += 1;
                self.logger.log_snapshot_out_of_date(snapshot);
                continue;
            }

            match self.commit(snapshot, now) {
                Ok(()) => {
                    report.committed += 1;
                    self.metrics.inc_history_commits();
                }
                Err(e) if e.is_stale_update() => {
                    report.stale += 1;
                    debug!(
                        cluster = %snapshot.cluster_name,
                        error = %e,
                        "History already has this timestamp, retrying next tick"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.inc_history_commit_errors();
                    warn!(
                        cluster = %snapshot.cluster_name,
                        error = %e,
                        "Failed to commit usage snapshot to history"
                    );
                }
            }
        }

        self.metrics.set_snapshots_out_of_date(report.out_of_date);
        Ok(report)
    }

    fn write_current_usage(&self, snapshots: &[UsageSnapshot]) -> bool {
        let path = self.paths.current_usage_file();
        let result = serde_json::to_vec_pretty(snapshots)
            .map_err(std::io::Error::from)
            .and_then(|json| write_atomic(&path, &json));

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write current usage");
                false
            }
        }
    }

    fn commit(&self, snapshot: &UsageSnapshot, now: DateTime<Utc>) -> Result<(), TsdbError> {
        let path = self.paths.history_archive(&snapshot.cluster_name);
        let mut archive = Archive::create(&path, self.config.step_secs)?;
        archive.append(now, snapshot.cpu_total(), snapshot.mem_total())
    }
}
