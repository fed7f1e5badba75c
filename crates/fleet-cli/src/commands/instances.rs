//! Instance listing

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, Instance, InstanceList};
use crate::output::{print_rows, OutputFormat};

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Port")]
    port: u16,
    #[tabled(rename = "Auth")]
    auth: String,
    #[tabled(rename = "Age")]
    age: String,
}

impl From<&Instance> for InstanceRow {
    fn from(instance: &Instance) -> Self {
        Self {
            cluster: instance.cluster_name.clone(),
            name: instance.name.clone(),
            port: instance.host_port,
            auth: instance.auth_type.clone(),
            age: format_age(Utc::now() - instance.creation_timestamp),
        }
    }
}

fn format_age(age: chrono::Duration) -> String {
    if age.num_days() > 0 {
        format!("{}d", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{}h", age.num_hours())
    } else {
        format!("{}m", age.num_minutes().max(0))
    }
}

/// List the collector instances the daemon manages
pub async fn list_instances(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let list: InstanceList = client.get("api/v1/instances", &[]).await?;

    let rows: Vec<InstanceRow> = list.instances.iter().map(InstanceRow::from).collect();
    print_rows(&rows, &list, format)?;

    if let OutputFormat::Table = format {
        println!("Next host port: {}", list.next_host_port.to_string().cyan());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(chrono::Duration::minutes(42)), "42m");
        assert_eq!(format_age(chrono::Duration::hours(5)), "5h");
        assert_eq!(format_age(chrono::Duration::days(3)), "3d");
        assert_eq!(format_age(chrono::Duration::seconds(-5)), "0m");
    }
}
