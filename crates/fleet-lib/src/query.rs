//! Usage history query validation and rendering

use crate::models::UsageHistory;
use crate::rollup::Period;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::str::FromStr;
use thiserror::Error;

/// Timestamp format accepted in queries and written to CSV
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Cluster selector that matches every cluster with history
pub const ALL_CLUSTERS: &str = "all";

/// Range used when a query omits `start`
pub const DEFAULT_RANGE_HOURS: i64 = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("unsupported format {0:?}, expected json or csv")]
    InvalidFormat(String),

    #[error("unsupported period {0:?}, expected hourly or monthly")]
    InvalidPeriod(String),

    #[error("invalid {field} date {value:?}, expected YYYY-MM-DDTHH:MM:SS")]
    InvalidDate { field: &'static str, value: String },

    #[error("start {start} is after end {end}")]
    StartAfterEnd { start: String, end: String },
}

/// Response encoding of a history query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

impl FromStr for OutputFormat {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(QueryError::InvalidFormat(other.to_string())),
        }
    }
}

/// Which clusters a query covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterSelector {
    All,
    One(String),
}

/// Query parameters as received
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawUsageQuery {
    pub cluster: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub period: Option<String>,
    pub format: Option<String>,
}

/// A validated history query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageQuery {
    pub cluster: ClusterSelector,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period: Period,
    pub format: OutputFormat,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_date(field: &'static str, value: &str) -> Result<DateTime<Utc>, QueryError> {
    NaiveDateTime::parse_from_str(value, DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| QueryError::InvalidDate {
            field,
            value: value.to_string(),
        })
}

impl RawUsageQuery {
    /// Validate against `now`.
    ///
    /// Empty dates default to `end = now` and `start = end - 24h`; a non-empty
    /// date that does not parse rejects the query.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<UsageQuery, QueryError> {
        let format = match non_empty(&self.format) {
            Some(f) => f.parse()?,
            None => OutputFormat::default(),
        };

        let period = match non_empty(&self.period) {
            Some(p) => p
                .parse::<Period>()
                .map_err(|_| QueryError::InvalidPeriod(p.to_string()))?,
            None => Period::default(),
        };

        let end = match non_empty(&self.end) {
            Some(v) => parse_date("end", v)?,
            None => now,
        };
        let start = match non_empty(&self.start) {
            Some(v) => parse_date("start", v)?,
            None => end - Duration::hours(DEFAULT_RANGE_HOURS),
        };

        if start > end {
            return Err(QueryError::StartAfterEnd {
                start: start.format(DATE_FORMAT).to_string(),
                end: end.format(DATE_FORMAT).to_string(),
            });
        }

        let cluster = match non_empty(&self.cluster) {
            None | Some(ALL_CLUSTERS) => ClusterSelector::All,
            Some(name) => ClusterSelector::One(name.to_string()),
        };

        Ok(UsageQuery {
            cluster,
            start,
            end,
            period,
            format,
        })
    }
}

/// CPU and memory rows joined on timestamp; a value missing from one series
/// leaves its column empty
fn joined_rows(history: &UsageHistory) -> BTreeMap<DateTime<Utc>, (Option<f64>, Option<f64>)> {
    let mut rows: BTreeMap<DateTime<Utc>, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for point in &history.cpu {
        rows.entry(point.timestamp).or_default().0 = Some(point.value);
    }
    for point in &history.mem {
        rows.entry(point.timestamp).or_default().1 = Some(point.value);
    }
    rows
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Render one cluster's history as `timestamp,cpu,memory`
pub fn render_csv(history: &UsageHistory) -> String {
    let mut out = String::from("timestamp,cpu,memory\n");
    for (timestamp, (cpu, mem)) in joined_rows(history) {
        let _ = writeln!(
            out,
            "{},{},{}",
            timestamp.format(DATE_FORMAT),
            cell(cpu),
            cell(mem)
        );
    }
    out
}

/// Render several clusters as `cluster,timestamp,cpu,memory`
pub fn render_csv_all(histories: &BTreeMap<String, UsageHistory>) -> String {
    let mut out = String::from("cluster,timestamp,cpu,memory\n");
    for (cluster, history) in histories {
        for (timestamp, (cpu, mem)) in joined_rows(history) {
            let _ = writeln!(
                out,
                "{},{},{},{}",
                cluster,
                timestamp.format(DATE_FORMAT),
                cell(cpu),
                cell(mem)
            );
        }
    }
    out
}
