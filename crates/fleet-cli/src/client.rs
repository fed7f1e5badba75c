//! API client for the fleet usage daemon

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// API client for the fleet usage daemon
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    async fn send(&self, path: &str, query: &[(&str, String)]) -> Result<Response> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.message)
                .unwrap_or(body);
            anyhow::bail!("API error ({}): {}", status, message);
        }

        Ok(response)
    }

    /// Make a GET request and decode the JSON body
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.send(path, query)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    /// Make a GET request and return the raw body
    pub async fn get_text(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        self.send(path, query)
            .await?
            .text()
            .await
            .context("Failed to read response")
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub cluster_name: String,
    pub cluster_endpoint: String,
    pub data_volume_path: String,
    pub credential_volume_path: String,
    pub auth_type: String,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceList {
    pub next_host_port: u32,
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub cluster_name: String,
    pub cpu_used: f64,
    pub mem_used: f64,
    pub cpu_non_allocatable: f64,
    pub mem_non_allocatable: f64,
    pub out_of_date: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePoint {
    pub timestamp: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageHistory {
    pub cpu: Vec<UsagePoint>,
    pub mem: Vec<UsagePoint>,
}

/// History of every cluster, keyed by cluster
pub type FleetHistory = BTreeMap<String, UsageHistory>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_decodes_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/instances")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"nextHostPort": 49001, "instances": []}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let list: InstanceList = client.get("api/v1/instances", &[]).await.unwrap();

        assert_eq!(list.next_host_port, 49001);
        assert!(list.instances.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_parameters_are_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/usage/history")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("cluster".into(), "gke/proj/prod".into()),
                mockito::Matcher::UrlEncoded("format".into(), "csv".into()),
            ]))
            .with_status(200)
            .with_body("timestamp,cpu,memory\n")
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let body = client
            .get_text(
                "api/v1/usage/history",
                &[
                    ("cluster", "gke/proj/prod".to_string()),
                    ("format", "csv".to_string()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(body, "timestamp,cpu,memory\n");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_payload_message_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/usage/history")
            .with_status(400)
            .with_body(r#"{"error": "bad_request", "message": "unsupported period \"daily\""}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client
            .get::<UsageHistory>("api/v1/usage/history", &[])
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("400"));
        assert!(message.contains("unsupported period"));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
