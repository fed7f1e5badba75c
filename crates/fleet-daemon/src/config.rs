//! Daemon configuration

use anyhow::{Context, Result};
use fleet_lib::fleet::ReconcilerConfig;
use fleet_lib::paths::FleetPaths;
use fleet_lib::tsdb::DEFAULT_STEP_SECS;
use fleet_lib::usage::{ArchiveLayout, ConsolidationConfig, DEFAULT_NON_ALLOCATABLE_ARCHIVE};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, read from `FLEET_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// API server port for health, metrics and usage queries
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Root of all persisted state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Cluster inventory written by external discovery
    /// (default: `<data_dir>/clusters.json`)
    #[serde(default)]
    pub inventory_path: Option<PathBuf>,

    #[serde(default = "default_interval")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_interval")]
    pub consolidation_interval_secs: u64,

    /// Bound on every discovery and runtime call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Ceiling for the reconciliation backoff
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_collector_image")]
    pub collector_image: String,

    #[serde(default = "default_collector_container_port")]
    pub collector_container_port: u16,

    /// File name of the archive holding the non-allocatable baseline
    #[serde(default = "default_non_allocatable_archive")]
    pub non_allocatable_archive: String,

    /// Container runtime CLI
    #[serde(default = "default_runtime_binary")]
    pub runtime_binary: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleet-usage")
}

fn default_interval() -> u64 {
    300
}

fn default_call_timeout() -> u64 {
    60
}

fn default_backoff_max() -> u64 {
    300
}

fn default_collector_image() -> String {
    ReconcilerConfig::default().image
}

fn default_collector_container_port() -> u16 {
    5483
}

fn default_non_allocatable_archive() -> String {
    DEFAULT_NON_ALLOCATABLE_ARCHIVE.to_string()
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

impl DaemonConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::from_env(config::Environment::with_prefix("FLEET"))
    }

    pub fn from_env(env: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(env)
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid FLEET_* configuration")
    }

    pub fn paths(&self) -> FleetPaths {
        FleetPaths::new(&self.data_dir)
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.inventory_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("clusters.json"))
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.reconcile_interval_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            image: self.collector_image.clone(),
            container_port: self.collector_container_port,
        }
    }

    pub fn consolidation_config(&self) -> ConsolidationConfig {
        ConsolidationConfig {
            interval: Duration::from_secs(self.consolidation_interval_secs),
            step_secs: DEFAULT_STEP_SECS,
        }
    }

    pub fn archive_layout(&self) -> ArchiveLayout {
        ArchiveLayout::new(self.non_allocatable_archive.clone())
    }
}
