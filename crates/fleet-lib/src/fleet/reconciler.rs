//! Fleet reconciliation loop
//!
//! One pass per discovery cycle. For each discovered cluster:
//!
//! ```text
//! discovered -> has credentials? -> registered and alive? -> satisfied
//!                                 \-> (deregister dead) -> provision -> registered
//! ```
//!
//! A failure aborts only the affected cluster and marks the round as failed.
//! After a failed round the next one follows a Fibonacci backoff instead of the
//! regular interval.

use super::backoff::FibonacciBackoff;
use super::credentials::write_credentials;
use super::{ClusterSource, FleetError, RuntimeManager, RuntimeState};
use crate::health::{components, HealthRegistry};
use crate::models::{sanitize_cluster_name, Instance, ManagedCluster};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::paths::FleetPaths;
use crate::registry::InstanceRegistry;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Base time between rounds (default: 5 minutes)
    pub interval: Duration,
    /// Bound on every cluster source and runtime call
    pub call_timeout: Duration,
    /// Ceiling for the retry delay after failed rounds
    pub backoff_max: Duration,
    /// Collector image run for each cluster
    pub image: String,
    /// Port the collector listens on inside its container
    pub container_port: u16,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            call_timeout: Duration::from_secs(60),
            backoff_max: Duration::from_secs(300),
            image: "ghcr.io/fleet-usage/collector:latest".to_string(),
            container_port: 5483,
        }
    }
}

/// Outcome of one reconciliation round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub discovered: usize,
    /// Clusters whose instance was already alive
    pub satisfied: usize,
    pub provisioned: usize,
    pub deregistered: usize,
    /// Clusters without usable credentials
    pub skipped: usize,
    pub errors: usize,
    pub pruned: usize,
}

impl RoundReport {
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

enum ClusterOutcome {
    Satisfied,
    Provisioned { replaced: bool },
    Skipped,
}

pub struct FleetReconciler {
    source: Arc<dyn ClusterSource>,
    runtime: Arc<dyn RuntimeManager>,
    paths: FleetPaths,
    config: ReconcilerConfig,
    backoff: FibonacciBackoff,
    /// Set once the collector image has been seen locally
    image_ready: bool,
    metrics: FleetMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl FleetReconciler {
    pub fn new(
        source: Arc<dyn ClusterSource>,
        runtime: Arc<dyn RuntimeManager>,
        paths: FleetPaths,
        config: ReconcilerConfig,
    ) -> Self {
        let backoff = FibonacciBackoff::new(config.backoff_max);
        Self {
            source,
            runtime,
            paths,
            config,
            backoff,
            image_ready: false,
            metrics: FleetMetrics::new(),
            logger: StructuredLogger::new("reconciler"),
            health: None,
        }
    }

    /// Report round outcomes to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn backoff(&self) -> &FibonacciBackoff {
        &self.backoff
    }

    /// Wait before the next round: the Fibonacci backoff after a failed round,
    /// the regular interval otherwise
    pub fn next_delay(&self) -> Duration {
        if self.backoff.failures() > 0 {
            return self.backoff.delay();
        }
        self.config.interval
    }

    /// Run rounds until shutdown. A round in progress always completes, so a
    /// registry write is never interrupted.
    ///
    /// Returns an error only when the collector image could never be obtained.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), FleetError> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            image = %self.config.image,
            "Starting fleet reconciler"
        );

        loop {
            if let Err(e) = self.reconcile().await {
                if e.is_fatal() {
                    error!(error = %e, "Fleet reconciler cannot continue");
                    return Err(e);
                }
            }

            let delay = self.next_delay();
            debug!(delay_secs = delay.as_secs(), "Waiting for next reconciliation round");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    info!("Shutting down fleet reconciler");
                    return Ok(());
                }
            }
        }
    }

    /// Run one round and update backoff, metrics and health from its outcome
    pub async fn reconcile(&mut self) -> Result<RoundReport, FleetError> {
        self.metrics.inc_reconcile_rounds();
        let result = self.run_round().await;

        let errors = match &result {
            Ok(report) => report.errors,
            Err(_) => 1,
        };
        if errors == 0 {
            self.backoff.reset();
        } else {
            self.metrics.inc_reconcile_errors();
            self.backoff.record_failure();
        }
        let backoff_secs = self.backoff.delay().as_secs();
        self.metrics.set_backoff_seconds(backoff_secs);
        self.logger.log_round_result(errors, backoff_secs);

        if let Some(health) = &self.health {
            match &result {
                Ok(report) => {
                    health
                        .report_tick(components::RECONCILER, report.errors, report.discovered.max(1))
                        .await;
                }
                Err(e) => {
                    health
                        .set_unhealthy(components::RECONCILER, e.to_string())
                        .await;
                }
            }
        }

        result
    }

    /// One reconciliation pass over every discovered cluster.
    ///
    /// Discovery, registry and runtime-listing failures fail the whole round.
    /// Per-cluster failures are counted in the report.
    pub async fn run_round(&mut self) -> Result<RoundReport, FleetError> {
        let source = self.source.clone();
        let clusters = match self.call("list clusters", source.list_clusters()).await {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(error = %e, "Cluster discovery failed");
                return Err(e);
            }
        };

        let mut registry = match InstanceRegistry::load(self.paths.registry_file()) {
            Ok(registry) => {
                self.set_registry_health(None).await;
                registry
            }
            Err(e) => {
                error!(error = %e, "Failed to load instance registry");
                self.set_registry_health(Some(e.to_string())).await;
                return Err(e.into());
            }
        };

        let runtime = self.runtime.clone();
        let states = self.call("list instance states", runtime.all_states()).await?;

        let mut report = RoundReport {
            discovered: clusters.len(),
            ..RoundReport::default()
        };

        for cluster in clusters.values() {
            match self.reconcile_cluster(&mut registry, cluster, &states).await {
                Ok(ClusterOutcome::Satisfied) => report.satisfied += 1,
                Ok(ClusterOutcome::Provisioned { replaced }) => {
                    report.provisioned += 1;
                    if replaced {
                        report.deregistered += 1;
                    }
                }
                Ok(ClusterOutcome::Skipped) => report.skipped += 1,
                Err(e) if e.is_fatal() => {
                    self.metrics.set_instances_managed(registry.len());
                    return Err(e);
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(cluster = %cluster.name, error = %e, "Failed to reconcile cluster");
                }
            }
        }

        self.metrics.set_instances_managed(registry.len());

        match self.call("prune stopped instances", runtime.prune_stopped()).await {
            Ok(pruned) => {
                if !pruned.is_empty() {
                    info!(count = pruned.len(), "Pruned stopped instances");
                }
                report.pruned = pruned.len();
            }
            Err(e) => warn!(error = %e, "Failed to prune stopped instances"),
        }

        Ok(report)
    }

    async fn reconcile_cluster(
        &mut self,
        registry: &mut InstanceRegistry,
        cluster: &ManagedCluster,
        states: &HashMap<String, RuntimeState>,
    ) -> Result<ClusterOutcome, FleetError> {
        let credential_dir = self.paths.credential_volume(&cluster.name);
        let Some(auth_type) = write_credentials(&credential_dir, cluster)? else {
            self.logger
                .log_cluster_skipped(&cluster.name, "no usable authentication material");
            return Ok(ClusterOutcome::Skipped);
        };

        let mut replaced = false;
        if let Some(existing) = registry.find(&cluster.name) {
            let state = states.get(&existing.id);
            if state.map(RuntimeState::is_alive).unwrap_or(false) {
                debug!(cluster = %cluster.name, instance = %existing.name, "Instance alive");
                return Ok(ClusterOutcome::Satisfied);
            }

            let state = state.map(ToString::to_string).unwrap_or_else(|| "absent".to_string());
            if let Some(dead) = registry.deregister(&cluster.name) {
                registry.save()?;
                self.logger.log_instance_deregistered(&dead, &state);
                replaced = true;
            }
        }

        self.ensure_image().await?;

        // The counter is persisted before the runtime sees the port so a crash
        // can never hand the same port out twice
        let host_port = registry.allocate_port()?;
        registry.save()?;

        let sanitized = sanitize_cluster_name(&cluster.name);
        let mut instance = Instance {
            id: String::new(),
            name: format!("usage-collector-{}-{}", sanitized, host_port),
            image: self.config.image.clone(),
            host_port,
            container_port: self.config.container_port,
            cluster_name: cluster.name.clone(),
            cluster_endpoint: cluster.api_endpoint.clone(),
            data_volume_path: self
                .paths
                .data_volume(&cluster.name)
                .to_string_lossy()
                .into_owned(),
            credential_volume_path: credential_dir.to_string_lossy().into_owned(),
            auth_type,
            creation_timestamp: Utc::now(),
        };

        std::fs::create_dir_all(&instance.data_volume_path).map_err(|source| FleetError::Io {
            path: instance.data_volume_path.clone().into(),
            source,
        })?;

        let runtime = self.runtime.clone();
        let id = self.call("create instance", runtime.create(&instance)).await?;
        instance.id = id;

        registry.register(instance.clone())?;
        registry.save()?;

        self.metrics.inc_instances_provisioned();
        self.logger.log_instance_provisioned(&instance);
        Ok(ClusterOutcome::Provisioned { replaced })
    }

    /// Make sure the collector image is available locally, pulling it if needed
    async fn ensure_image(&mut self) -> Result<(), FleetError> {
        let runtime = self.runtime.clone();
        let image = self.config.image.clone();

        let present = self.call("inspect image", runtime.image_present(&image)).await;
        let result = match present {
            Ok(true) => Ok(()),
            Ok(false) => self
                .call("pull image", runtime.pull_image(&image))
                .await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.image_ready = true;
                Ok(())
            }
            Err(e) if !self.image_ready => Err(FleetError::ImageUnavailable {
                image,
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn set_registry_health(&self, failure: Option<String>) {
        if let Some(health) = &self.health {
            match failure {
                None => health.set_healthy(components::REGISTRY).await,
                Some(message) => health.set_unhealthy(components::REGISTRY, message).await,
            }
        }
    }

    /// Await a collaborator call under the configured timeout
    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, FleetError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(FleetError::Collaborator {
                operation,
                message: format!("{:#}", e),
            }),
            Err(_) => Err(FleetError::Timeout {
                operation,
                timeout_secs: self.config.call_timeout.as_secs(),
            }),
        }
    }
}
