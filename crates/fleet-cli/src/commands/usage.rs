//! Usage commands

use anyhow::Result;
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::client::{ApiClient, FleetHistory, UsageHistory, UsageSnapshot};
use crate::output::{color_freshness, format_bytes, format_cores, print_rows, OutputFormat};

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "CPU Used")]
    cpu_used: String,
    #[tabled(rename = "Memory Used")]
    mem_used: String,
    #[tabled(rename = "CPU Reserved")]
    cpu_non_allocatable: String,
    #[tabled(rename = "Memory Reserved")]
    mem_non_allocatable: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Timestamp")]
    timestamp: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Memory")]
    mem: String,
}

/// Filters for a history query
#[derive(Debug, Default)]
pub struct HistoryArgs {
    pub cluster: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub period: Option<String>,
    pub csv: bool,
}

impl HistoryArgs {
    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(cluster) = &self.cluster {
            query.push(("cluster", cluster.clone()));
        }
        if let Some(start) = &self.start {
            query.push(("start", start.clone()));
        }
        if let Some(end) = &self.end {
            query.push(("end", end.clone()));
        }
        if let Some(period) = &self.period {
            query.push(("period", period.clone()));
        }
        if self.csv {
            query.push(("format", "csv".to_string()));
        }
        query
    }

    fn single_cluster(&self) -> Option<&str> {
        self.cluster.as_deref().filter(|c| *c != "all")
    }
}

/// Show the latest snapshot of every cluster
pub async fn show_current(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let snapshots: Vec<UsageSnapshot> = client.get("api/v1/usage/current", &[]).await?;

    let rows: Vec<SnapshotRow> = snapshots
        .iter()
        .map(|s| SnapshotRow {
            cluster: s.cluster_name.clone(),
            cpu_used: format_cores(s.cpu_used),
            mem_used: format_bytes(s.mem_used),
            cpu_non_allocatable: format_cores(s.cpu_non_allocatable),
            mem_non_allocatable: format_bytes(s.mem_non_allocatable),
            status: color_freshness(s.out_of_date),
        })
        .collect();

    print_rows(&rows, &snapshots, format)
}

/// Show usage history for one cluster or the whole fleet
pub async fn show_history(client: &ApiClient, args: HistoryArgs, format: OutputFormat) -> Result<()> {
    let query = args.query();
    let path = "api/v1/usage/history";

    if args.csv {
        let body = client.get_text(path, &query).await?;
        print!("{}", body);
        return Ok(());
    }

    match args.single_cluster() {
        Some(cluster) => {
            let history: UsageHistory = client.get(path, &query).await?;
            let rows = history_rows(cluster, &history);
            print_rows(&rows, &history, format)
        }
        None => {
            let fleet: FleetHistory = client.get(path, &query).await?;
            let rows: Vec<HistoryRow> = fleet
                .iter()
                .flat_map(|(cluster, history)| history_rows(cluster, history))
                .collect();
            print_rows(&rows, &fleet, format)
        }
    }
}

/// Join the two series on timestamp
fn history_rows(cluster: &str, history: &UsageHistory) -> Vec<HistoryRow> {
    let mut joined: BTreeMap<&str, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for point in &history.cpu {
        joined.entry(point.timestamp.as_str()).or_default().0 = Some(point.value);
    }
    for point in &history.mem {
        joined.entry(point.timestamp.as_str()).or_default().1 = Some(point.value);
    }

    joined
        .into_iter()
        .map(|(timestamp, (cpu, mem))| HistoryRow {
            cluster: cluster.to_string(),
            timestamp: timestamp.to_string(),
            cpu: cpu.map(format_cores).unwrap_or_else(|| "-".to_string()),
            mem: mem.map(format_bytes).unwrap_or_else(|| "-".to_string()),
        })
        .collect()
}
