//! Credential volume contents
//!
//! A monitoring instance reads its cluster credentials from a mounted
//! directory. Exactly one credential kind is present at a time.

use super::FleetError;
use crate::models::{AuthType, Credential, ManagedCluster};
use crate::persist::{write_atomic, write_atomic_private};
use std::path::Path;
use tracing::debug;

pub const TOKEN_FILE: &str = "token";
pub const CLIENT_CERT_FILE: &str = "client.crt";
pub const CLIENT_KEY_FILE: &str = "client.key";
pub const BASIC_AUTH_FILE: &str = "basic-auth";
pub const CA_FILE: &str = "ca.crt";

const CREDENTIAL_FILES: &[&str] = &[TOKEN_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE, BASIC_AUTH_FILE];

/// Write the cluster's preferred credential and CA data into `dir`.
///
/// Returns `None` without touching the filesystem when the cluster has no
/// usable authentication material.
pub fn write_credentials(dir: &Path, cluster: &ManagedCluster) -> Result<Option<AuthType>, FleetError> {
    let Some(credential) = cluster.auth.resolve() else {
        return Ok(None);
    };

    let files: Vec<(&str, &str)> = match credential {
        Credential::BearerToken(token) => vec![(TOKEN_FILE, token)],
        Credential::ClientCertificate { cert, key } => {
            vec![(CLIENT_CERT_FILE, cert), (CLIENT_KEY_FILE, key)]
        }
        Credential::BasicAuth(token) => vec![(BASIC_AUTH_FILE, token)],
    };

    let io_err = |source: std::io::Error| FleetError::Io {
        path: dir.to_path_buf(),
        source,
    };

    create_private_dir(dir).map_err(io_err)?;
    for (file, content) in &files {
        write_atomic_private(&dir.join(file), content.as_bytes()).map_err(io_err)?;
    }

    // Leftovers from a previous credential kind would confuse the collector
    for stale in CREDENTIAL_FILES.iter().filter(|f| !files.iter().any(|(w, _)| w == *f)) {
        match std::fs::remove_file(dir.join(stale)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }
    }

    if !cluster.ca_data.is_empty() {
        write_atomic(&dir.join(CA_FILE), cluster.ca_data.as_bytes()).map_err(io_err)?;
    }

    let auth_type = credential.auth_type();
    debug!(cluster = %cluster.name, auth_type = %auth_type, dir = %dir.display(), "Wrote cluster credentials");
    Ok(Some(auth_type))
}

/// Create `dir` accessible to its owner only, tightening it if it already exists
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
    }

    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthMaterial;
    use tempfile::TempDir;

    fn cluster(auth: AuthMaterial) -> ManagedCluster {
        ManagedCluster {
            name: "prod".to_string(),
            api_endpoint: "https://prod:6443".to_string(),
            auth,
            ca_data: "CA".to_string(),
        }
    }

    #[test]
    fn test_no_material_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let creds = dir.path().join("creds");

        let result = write_credentials(&creds, &cluster(AuthMaterial::default())).unwrap();
        assert_eq!(result, None);
        assert!(!creds.exists());
    }

    #[test]
    fn test_bearer_token_wins() {
        let dir = TempDir::new().unwrap();
        let auth = AuthMaterial {
            bearer_token: Some("tok".to_string()),
            basic_auth_token: Some("basic".to_string()),
            ..AuthMaterial::default()
        };

        let result = write_credentials(dir.path(), &cluster(auth)).unwrap();
        assert_eq!(result, Some(AuthType::BearerToken));
        assert_eq!(std::fs::read_to_string(dir.path().join(TOKEN_FILE)).unwrap(), "tok");
        assert_eq!(std::fs::read_to_string(dir.path().join(CA_FILE)).unwrap(), "CA");
        assert!(!dir.path().join(BASIC_AUTH_FILE).exists());
    }

    #[test]
    fn test_switching_kind_removes_old_files() {
        let dir = TempDir::new().unwrap();
        let token = AuthMaterial {
            bearer_token: Some("tok".to_string()),
            ..AuthMaterial::default()
        };
        write_credentials(dir.path(), &cluster(token)).unwrap();

        let x509 = AuthMaterial {
            client_certificate: Some("cert".to_string()),
            client_key: Some("key".to_string()),
            ..AuthMaterial::default()
        };
        let result = write_credentials(dir.path(), &cluster(x509)).unwrap();

        assert_eq!(result, Some(AuthType::X509));
        assert!(!dir.path().join(TOKEN_FILE).exists());
        assert_eq!(std::fs::read_to_string(dir.path().join(CLIENT_KEY_FILE)).unwrap(), "key");
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let creds = dir.path().join("instances").join("prod").join("credentials");
        let auth = AuthMaterial {
            basic_auth_token: Some("basic".to_string()),
            ..AuthMaterial::default()
        };
        write_credentials(&creds, &cluster(auth)).unwrap();

        let mode = |path: &Path| std::fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&creds.join(BASIC_AUTH_FILE)), 0o600);
        assert_eq!(mode(&creds), 0o700);
        assert!(!creds.join("basic-auth.tmp").exists());
    }
}
