//! Fleet reconciliation
//!
//! Discovers clusters through a [`ClusterSource`], provisions one monitoring
//! instance per cluster through a [`RuntimeManager`] and records the result in
//! the [`InstanceRegistry`](crate::registry::InstanceRegistry).

mod backoff;
mod credentials;
mod docker;
mod inventory;
mod reconciler;


pub use backoff::{fibonacci, FibonacciBackoff};
pub use credentials::{
    write_credentials, BASIC_AUTH_FILE, CA_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE, TOKEN_FILE,
};
pub use docker::{DockerRuntime, MANAGED_LABEL};
pub use inventory::{Inventory, InventoryClusterSource};
pub use reconciler::{FleetReconciler, ReconcilerConfig, RoundReport};

use crate::models::{Instance, ManagedCluster};
use crate::registry::RegistryError;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub use async_trait::async_trait;

/// Source of the clusters that should be monitored
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// Clusters keyed by name
    async fn list_clusters(&self) -> Result<BTreeMap<String, ManagedCluster>>;
}

/// Container runtime that runs monitoring instances
#[async_trait]
pub trait RuntimeManager: Send + Sync {
    async fn image_present(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create and start an instance, returning its runtime handle
    async fn create(&self, instance: &Instance) -> Result<String>;

    /// States of all managed instances, keyed by runtime handle
    async fn all_states(&self) -> Result<HashMap<String, RuntimeState>>;

    /// Remove stopped instances, returning the removed handles
    async fn prune_stopped(&self) -> Result<Vec<String>>;
}

/// Runtime state of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Other(String),
}

impl RuntimeState {
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => RuntimeState::Created,
            "running" => RuntimeState::Running,
            "restarting" => RuntimeState::Restarting,
            "paused" => RuntimeState::Paused,
            "exited" => RuntimeState::Exited,
            "dead" => RuntimeState::Dead,
            other => RuntimeState::Other(other.to_string()),
        }
    }

    /// Whether the instance is running or about to
    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            RuntimeState::Created | RuntimeState::Running | RuntimeState::Restarting
        )
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeState::Created => f.write_str("created"),
            RuntimeState::Running => f.write_str("running"),
            RuntimeState::Restarting => f.write_str("restarting"),
            RuntimeState::Paused => f.write_str("paused"),
            RuntimeState::Exited => f.write_str("exited"),
            RuntimeState::Dead => f.write_str("dead"),
            RuntimeState::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: &'static str,
        timeout_secs: u64,
    },

    #[error("{operation} failed: {message}")]
    Collaborator {
        operation: &'static str,
        message: String,
    },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("collector image {image} is unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl FleetError {
    /// Whether the daemon cannot do useful work after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, FleetError::ImageUnavailable { .. })
    }
}
