//! JSON inventory cluster source
//!
//! Cloud discovery runs outside the daemon and drops its results into an
//! inventory file. The file is re-read on every reconciliation pass.

use super::ClusterSource;
use crate::models::ManagedCluster;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Inventory file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub clusters: Vec<ManagedCluster>,
}

pub struct InventoryClusterSource {
    path: PathBuf,
}

impl InventoryClusterSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ClusterSource for InventoryClusterSource {
    async fn list_clusters(&self) -> Result<BTreeMap<String, ManagedCluster>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No cluster inventory yet");
                return Ok(BTreeMap::new());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read inventory {}", self.path.display())
                })
            }
        };

        let inventory: Inventory = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse inventory {}", self.path.display()))?;

        let mut clusters = BTreeMap::new();
        for cluster in inventory.clusters {
            if cluster.name.trim().is_empty() {
                warn!(endpoint = %cluster.api_endpoint, "Ignoring inventory entry without a name");
                continue;
            }
            if let Some(previous) = clusters.insert(cluster.name.clone(), cluster) {
                warn!(cluster = %previous.name, "Duplicate inventory entry, keeping the last one");
            }
        }

        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_inventory_is_empty() {
        let dir = TempDir::new().unwrap();
        let source = InventoryClusterSource::new(dir.path().join("clusters.json"));

        assert!(source.list_clusters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parse_inventory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clusters.json");
        std::fs::write(
            &path,
            r#"{
                "clusters": [
                    {"name": "gke/proj/prod", "apiEndpoint": "https://1.2.3.4", "caData": "CA", "bearerToken": "tok"},
                    {"name": "dev", "apiEndpoint": "https://dev:6443", "clientCertificate": "c", "clientKey": "k"},
                    {"name": "dev", "apiEndpoint": "https://dev2:6443"},
                    {"name": "", "apiEndpoint": "https://nameless"}
                ]
            }"#,
        )
        .unwrap();

        let clusters = InventoryClusterSource::new(&path).list_clusters().await.unwrap();
        assert_eq!(clusters.len(), 2);

        let prod = &clusters["gke/proj/prod"];
        assert_eq!(prod.ca_data, "CA");
        assert_eq!(prod.auth.bearer_token.as_deref(), Some("tok"));

        assert_eq!(clusters["dev"].api_endpoint, "https://dev2:6443");
        assert!(clusters["dev"].auth.resolve().is_none());
    }

    #[tokio::test]
    async fn test_invalid_inventory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clusters.json");
        std::fs::write(&path, "[not an inventory").unwrap();

        assert!(InventoryClusterSource::new(&path).list_clusters().await.is_err());
    }
}
