//! Durable fleet registry
//!
//! The registry is the single source of truth for fleet membership and host
//! port allocation. It is persisted as one JSON document:
//!
//! ```json
//! { "nextHostPort": 49002, "instances": [ ... ] }
//! ```
//!
//! `nextHostPort` only moves forward. It is the only guard against two
//! collectors binding the same host port, so it is never rolled back, not
//! even when an instance is removed or the process restarts.
//!
//! Concurrent writers from other processes are not supported.

use crate::models::Instance;
use crate::persist::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// First host port handed out to a monitoring instance
pub const FIRST_HOST_PORT: u16 = 49000;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error on registry {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse registry {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("host port range exhausted")]
    PortsExhausted,

    #[error("cluster {cluster} already has a registered instance")]
    AlreadyRegistered { cluster: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Persisted registry document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryState {
    /// Next port to hand out; one past `u16::MAX` once the range is used up
    pub next_host_port: u32,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            next_host_port: u32::from(FIRST_HOST_PORT),
            instances: Vec::new(),
        }
    }
}

/// File-backed registry of monitoring instances
#[derive(Debug)]
pub struct InstanceRegistry {
    path: PathBuf,
    state: RegistryState,
}

impl InstanceRegistry {
    /// Load the registry, initializing it when the file is missing or empty
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(RegistryError::Io { path, source }),
        };

        if content.trim().is_empty() {
            let registry = Self {
                path,
                state: RegistryState::default(),
            };
            registry.save()?;
            info!(
                path = %registry.path.display(),
                next_host_port = FIRST_HOST_PORT,
                "Initialized empty instance registry"
            );
            return Ok(registry);
        }

        let mut state: RegistryState =
            serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
                path: path.clone(),
                source,
            })?;

        // A hand-edited file must not let the counter fall behind a live port
        if let Some(max_port) = state.instances.iter().map(|i| i.host_port).max() {
            state.next_host_port = state.next_host_port.max(u32::from(max_port) + 1);
        }

        debug!(
            path = %path.display(),
            instances = state.instances.len(),
            next_host_port = state.next_host_port,
            "Loaded instance registry"
        );
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &RegistryState {
        &self.state
    }

    pub fn next_host_port(&self) -> u32 {
        self.state.next_host_port
    }

    pub fn instances(&self) -> &[Instance] {
        &self.state.instances
    }

    pub fn len(&self) -> usize {
        self.state.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.instances.is_empty()
    }

    /// Registered instance of a cluster
    pub fn find(&self, cluster_name: &str) -> Option<&Instance> {
        self.state
            .instances
            .iter()
            .find(|i| i.cluster_name == cluster_name)
    }

    /// Hand out the next host port. The counter advances even if the caller
    /// never uses the port.
    pub fn allocate_port(&mut self) -> Result<u16> {
        let port =
            u16::try_from(self.state.next_host_port).map_err(|_| RegistryError::PortsExhausted)?;
        self.state.next_host_port += 1;
        Ok(port)
    }

    /// Add an instance. A cluster can only have one.
    pub fn register(&mut self, instance: Instance) -> Result<()> {
        if self.find(&instance.cluster_name).is_some() {
            return Err(RegistryError::AlreadyRegistered {
                cluster: instance.cluster_name,
            });
        }
        self.state.next_host_port = self
            .state
            .next_host_port
            .max(u32::from(instance.host_port) + 1);
        self.state.instances.push(instance);
        Ok(())
    }

    /// Remove the instance of a cluster. The port counter is left untouched.
    pub fn deregister(&mut self, cluster_name: &str) -> Option<Instance> {
        let index = self
            .state
            .instances
            .iter()
            .position(|i| i.cluster_name == cluster_name)?;
        Some(self.state.instances.remove(index))
    }

    /// Write the registry atomically
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.path, &json).map_err(|source| RegistryError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Read the persisted registry without initializing or repairing it
    pub fn read_state(path: &Path) -> Result<RegistryState> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(RegistryState::default());
        }
        serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
