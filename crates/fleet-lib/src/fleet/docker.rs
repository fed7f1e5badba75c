//! Docker CLI runtime
//!
//! Drives the `docker` binary directly. Every container the daemon creates
//! carries [`MANAGED_LABEL`] so listing and pruning never touch anything else.

use super::{RuntimeManager, RuntimeState};
use crate::models::Instance;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

/// Label set on every managed container
pub const MANAGED_LABEL: &str = "fleet-usage.managed";

const CLUSTER_LABEL: &str = "fleet-usage.cluster";

/// Mount points inside the collector container
const DATA_MOUNT: &str = "/var/lib/collector/data";
const CREDENTIALS_MOUNT: &str = "/var/run/secrets/cluster";

pub struct DockerRuntime {
    binary: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, args: &[String]) -> Result<Output> {
        debug!(binary = %self.binary, args = ?args, "Running container runtime command");
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary))
    }

    /// Run a command that must succeed, returning its stdout
    async fn exec_ok(&self, args: &[String]) -> Result<String> {
        let output = self.exec(args).await?;
        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Arguments for `docker run` that start the collector of `instance`
pub(crate) fn run_args(instance: &Instance) -> Vec<String> {
    vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        instance.name.clone(),
        "--restart".to_string(),
        "unless-stopped".to_string(),
        "--label".to_string(),
        format!("{}=true", MANAGED_LABEL),
        "--label".to_string(),
        format!("{}={}", CLUSTER_LABEL, instance.cluster_name),
        "--publish".to_string(),
        format!("{}:{}", instance.host_port, instance.container_port),
        "--volume".to_string(),
        format!("{}:{}", instance.data_volume_path, DATA_MOUNT),
        "--volume".to_string(),
        format!("{}:{}:ro", instance.credential_volume_path, CREDENTIALS_MOUNT),
        "--env".to_string(),
        format!("CLUSTER_NAME={}", instance.cluster_name),
        "--env".to_string(),
        format!("CLUSTER_ENDPOINT={}", instance.cluster_endpoint),
        "--env".to_string(),
        format!("CLUSTER_AUTH_TYPE={}", instance.auth_type),
        "--env".to_string(),
        format!("CLUSTER_CREDENTIALS_DIR={}", CREDENTIALS_MOUNT),
        "--env".to_string(),
        format!("DATA_DIR={}", DATA_MOUNT),
        instance.image.clone(),
    ]
}

/// Parse `docker ps --format '{{.ID}}\t{{.State}}'` output
pub(crate) fn parse_states(stdout: &str) -> HashMap<String, RuntimeState> {
    stdout
        .lines()
        .filter_map(|line| {
            let (id, state) = line.trim().split_once('\t')?;
            Some((id.to_string(), RuntimeState::parse(state)))
        })
        .collect()
}

fn label_filter() -> String {
    format!("label={}=true", MANAGED_LABEL)
}

#[async_trait]
impl RuntimeManager for DockerRuntime {
    async fn image_present(&self, image: &str) -> Result<bool> {
        let output = self
            .exec(&["image".into(), "inspect".into(), image.into()])
            .await?;
        Ok(output.status.success())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "Pulling collector image");
        self.exec_ok(&["pull".into(), image.into()]).await?;
        Ok(())
    }

    async fn create(&self, instance: &Instance) -> Result<String> {
        let stdout = self
            .exec_ok(&run_args(instance))
            .await
            .with_context(|| format!("Failed to start {}", instance.name))?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            bail!("runtime returned no container id for {}", instance.name);
        }
        Ok(id)
    }

    async fn all_states(&self) -> Result<HashMap<String, RuntimeState>> {
        let stdout = self
            .exec_ok(&[
                "ps".into(),
                "--all".into(),
                "--no-trunc".into(),
                "--filter".into(),
                label_filter(),
                "--format".into(),
                "{{.ID}}\t{{.State}}".into(),
            ])
            .await?;
        Ok(parse_states(&stdout))
    }

    async fn prune_stopped(&self) -> Result<Vec<String>> {
        let stdout = self
            .exec_ok(&[
                "ps".into(),
                "--all".into(),
                "--quiet".into(),
                "--no-trunc".into(),
                "--filter".into(),
                label_filter(),
                "--filter".into(),
                "status=exited".into(),
                "--filter".into(),
                "status=dead".into(),
            ])
            .await?;

        let ids: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(ids);
        }

        let mut args = vec!["rm".to_string()];
        args.extend(ids.iter().cloned());
        self.exec_ok(&args).await?;
        Ok(ids)
    }
}
