//! Centralized state layout.
//!
//! All on-disk locations derive from a single data directory so the daemon,
//! its loops and the tests agree on where things live.

use crate::models::sanitize_cluster_name;
use crate::tsdb::ARCHIVE_EXTENSION;
use std::path::{Path, PathBuf};

/// File name of the fleet registry
pub const REGISTRY_FILE: &str = "instances.json";

/// File name of the current-usage artifact
pub const CURRENT_USAGE_FILE: &str = "current_usage.json";

/// Filesystem layout rooted at the data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetPaths {
    root: PathBuf,
}

impl FleetPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fleet registry JSON
    pub fn registry_file(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    /// Current usage of every cluster, overwritten each consolidation tick
    pub fn current_usage_file(&self) -> PathBuf {
        self.root.join(CURRENT_USAGE_FILE)
    }

    /// Directory holding one history archive per cluster
    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    /// History archive of a cluster
    pub fn history_archive(&self, cluster_name: &str) -> PathBuf {
        self.history_dir().join(format!(
            "{}.{}",
            sanitize_cluster_name(cluster_name),
            ARCHIVE_EXTENSION
        ))
    }

    /// Directory holding per-instance volumes
    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    /// Data volume mounted into a cluster's collector; it writes its archives here
    pub fn data_volume(&self, cluster_name: &str) -> PathBuf {
        self.instances_dir()
            .join(sanitize_cluster_name(cluster_name))
            .join("data")
    }

    /// Credential volume mounted read-only into a cluster's collector
    pub fn credential_volume(&self, cluster_name: &str) -> PathBuf {
        self.instances_dir()
            .join(sanitize_cluster_name(cluster_name))
            .join("credentials")
    }

    /// Create the directories the daemon cannot run without
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.history_dir())?;
        std::fs::create_dir_all(self.instances_dir())?;
        Ok(())
    }
}
