//! Historical usage rollups
//!
//! Reads cluster history archives and answers queries at native (5 minute),
//! hourly and monthly resolution. Nothing is cached: every query reads the
//! archives afresh, which is safe while the consolidation loop appends since
//! archive writes are atomic file replacements.

use crate::models::{unsanitize_cluster_name, UsageHistory, UsagePoint};
use crate::paths::FleetPaths;
use crate::tsdb::{Archive, TsdbError, ARCHIVE_EXTENSION};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Step of the native tier
pub const NATIVE_STEP_SECS: u64 = 300;

/// Step of the hourly tier
pub const HOURLY_STEP_SECS: u64 = 3600;

/// Hourly requests shorter than this are served from the native tier, which
/// avoids empty answers while an archive has not yet filled hourly rows.
pub const HOURLY_FALLBACK_HOURS: i64 = 25;

#[derive(Debug, Error)]
pub enum RollupError {
    #[error("no usage history for cluster {0}")]
    UnknownCluster(String),

    #[error(transparent)]
    Archive(#[from] TsdbError),

    #[error("failed to list history directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RollupError>;

/// Aggregation period of a history query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    #[default]
    Hourly,
    Monthly,
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Period::Hourly),
            "monthly" => Ok(Period::Monthly),
            other => Err(format!("unsupported period: {}", other)),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Hourly => f.write_str("hourly"),
            Period::Monthly => f.write_str("monthly"),
        }
    }
}

/// Query engine over the cluster history archives
#[derive(Debug, Clone)]
pub struct UsageRollup {
    paths: FleetPaths,
}

impl UsageRollup {
    pub fn new(paths: FleetPaths) -> Self {
        Self { paths }
    }

    /// Names of clusters that have a history archive
    pub fn clusters(&self) -> Result<Vec<String>> {
        let dir = self.paths.history_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(RollupError::Io { path: dir, source }),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXTENSION)
            })
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(unsanitize_cluster_name)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn open(&self, cluster_name: &str) -> Result<Archive> {
        let path = self.paths.history_archive(cluster_name);
        if !path.exists() {
            return Err(RollupError::UnknownCluster(cluster_name.to_string()));
        }
        Ok(Archive::open(path)?)
    }

    /// History at the archive's native 5 minute step
    pub fn fetch_native(
        &self,
        cluster_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageHistory> {
        self.fetch_step(cluster_name, start, end, NATIVE_STEP_SECS)
    }

    /// Hourly history; short ranges fall back to native resolution
    pub fn fetch_hourly(
        &self,
        cluster_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageHistory> {
        if end - start < Duration::hours(HOURLY_FALLBACK_HOURS) {
            return self.fetch_native(cluster_name, start, end);
        }
        self.fetch_step(cluster_name, start, end, HOURLY_STEP_SECS)
    }

    /// Hourly history summed per UTC calendar month
    pub fn fetch_monthly(
        &self,
        cluster_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageHistory> {
        let hourly = self.fetch_hourly(cluster_name, start, end)?;
        Ok(UsageHistory {
            cpu: fold_monthly(&hourly.cpu),
            mem: fold_monthly(&hourly.mem),
        })
    }

    pub fn fetch(
        &self,
        cluster_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: Period,
    ) -> Result<UsageHistory> {
        match period {
            Period::Hourly => self.fetch_hourly(cluster_name, start, end),
            Period::Monthly => self.fetch_monthly(cluster_name, start, end),
        }
    }

    /// History of every cluster with an archive
    pub fn fetch_all(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: Period,
    ) -> Result<BTreeMap<String, UsageHistory>> {
        let mut out = BTreeMap::new();
        for cluster in self.clusters()? {
            let history = self.fetch(&cluster, start, end, period)?;
            out.insert(cluster, history);
        }
        Ok(out)
    }

    fn fetch_step(
        &self,
        cluster_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_secs: u64,
    ) -> Result<UsageHistory> {
        let archive = self.open(cluster_name)?;
        let result = archive.fetch(start, end, step_secs);
        Ok(UsageHistory {
            cpu: result.series(0).map(UsagePoint::from).collect(),
            mem: result.series(1).map(UsagePoint::from).collect(),
        })
    }
}

/// Sum points per UTC `(year, month)`.
///
/// Input must be in ascending time order: a new bucket starts whenever the
/// month changes, so unordered input would split a month into several
/// buckets. Each bucket is dated at the first instant of its month.
pub fn fold_monthly(points: &[UsagePoint]) -> Vec<UsagePoint> {
    debug_assert!(
        points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp),
        "monthly rollup input must be sorted"
    );

    let mut out: Vec<UsagePoint> = Vec::new();
    let mut current_key: Option<(i32, u32)> = None;

    for point in points {
        let key = (point.timestamp.year(), point.timestamp.month());
        match out.last_mut() {
            Some(bucket) if current_key == Some(key) => bucket.value += point.value,
            _ => {
                let month_start = Utc
                    .with_ymd_and_hms(key.0, key.1, 1, 0, 0, 0)
                    .single()
                    .unwrap_or(point.timestamp);
                out.push(UsagePoint::new(month_start, point.value));
                current_key = Some(key);
            }
        }
    }

    out
}
