//! Core data models for the fleet usage tracker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authentication material discovered for a cluster.
///
/// Any combination may be present; [`AuthMaterial::resolve`] picks one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMaterial {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth_token: Option<String>,
}

impl AuthMaterial {
    /// Pick the credential to use: bearer token, then client certificate pair,
    /// then basic-auth token. Empty strings do not count.
    pub fn resolve(&self) -> Option<Credential<'_>> {
        fn present(value: &Option<String>) -> Option<&str> {
            value.as_deref().filter(|v| !v.trim().is_empty())
        }

        if let Some(token) = present(&self.bearer_token) {
            return Some(Credential::BearerToken(token));
        }
        if let (Some(cert), Some(key)) = (
            present(&self.client_certificate),
            present(&self.client_key),
        ) {
            return Some(Credential::ClientCertificate { cert, key });
        }
        present(&self.basic_auth_token).map(Credential::BasicAuth)
    }
}

/// A resolved credential borrowed from [`AuthMaterial`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    BearerToken(&'a str),
    ClientCertificate { cert: &'a str, key: &'a str },
    BasicAuth(&'a str),
}

impl Credential<'_> {
    pub fn auth_type(&self) -> AuthType {
        match self {
            Credential::BearerToken(_) => AuthType::BearerToken,
            Credential::ClientCertificate { .. } => AuthType::X509,
            Credential::BasicAuth(_) => AuthType::BasicAuth,
        }
    }
}

/// How a monitoring instance authenticates against its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    BearerToken,
    X509,
    BasicAuth,
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthType::BearerToken => "bearer-token",
            AuthType::X509 => "x509",
            AuthType::BasicAuth => "basic-auth",
        };
        f.write_str(s)
    }
}

/// A cluster as reported by the cluster source for one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedCluster {
    pub name: String,
    pub api_endpoint: String,
    #[serde(flatten)]
    pub auth: AuthMaterial,
    #[serde(default)]
    pub ca_data: String,
}

/// A monitoring instance provisioned for one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Runtime handle, empty until provisioned
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub cluster_name: String,
    pub cluster_endpoint: String,
    pub data_volume_path: String,
    pub credential_volume_path: String,
    pub auth_type: AuthType,
    pub creation_timestamp: DateTime<Utc>,
}

/// Point-in-time usage of one cluster, before it is committed to history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub cluster_name: String,
    pub cpu_used: f64,
    pub mem_used: f64,
    pub cpu_non_allocatable: f64,
    pub mem_non_allocatable: f64,
    pub out_of_date: bool,
}

impl UsageSnapshot {
    /// An empty snapshot that must not be committed
    pub fn out_of_date(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            cpu_used: 0.0,
            mem_used: 0.0,
            cpu_non_allocatable: 0.0,
            mem_non_allocatable: 0.0,
            out_of_date: true,
        }
    }

    /// CPU consumption including capacity reserved by the platform
    pub fn cpu_total(&self) -> f64 {
        self.cpu_used + self.cpu_non_allocatable
    }

    /// Memory consumption including capacity reserved by the platform
    pub fn mem_total(&self) -> f64 {
        self.mem_used + self.mem_non_allocatable
    }
}

/// One value of a usage history series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsagePoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl UsagePoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl From<(DateTime<Utc>, f64)> for UsagePoint {
    fn from((timestamp, value): (DateTime<Utc>, f64)) -> Self {
        Self { timestamp, value }
    }
}

/// CPU and memory history of one cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageHistory {
    pub cpu: Vec<UsagePoint>,
    pub mem: Vec<UsagePoint>,
}

/// Escape a cluster name for use in file and container names.
///
/// Real-world names carry separators such as `/` (GKE project paths), `:` and
/// `@` (EKS ARNs, kubeconfig users). ASCII alphanumerics, `-` and `.` are kept;
/// every other byte, `_` included, becomes `_` followed by two lowercase hex
/// digits. A leading `.` is escaped as well so no name maps onto `.` or `..`.
/// Distinct names always escape to distinct strings, see
/// [`unsanitize_cluster_name`].
pub fn sanitize_cluster_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    out
}

/// Reverse [`sanitize_cluster_name`]; `None` if `escaped` is not a valid escape.
pub fn unsanitize_cluster_name(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hex = escaped.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    let name = String::from_utf8(out).ok()?;
    (sanitize_cluster_name(&name) == escaped).then_some(name)
}
