//! Freshness-checked usage snapshots
//!
//! A collector writes one archive per resource type into its data volume.
//! One of them carries the non-allocatable baseline (capacity reserved by the
//! platform); the others carry used CPU and memory and are summed.

use crate::models::UsageSnapshot;
use crate::tsdb::{Archive, ARCHIVE_EXTENSION};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default file name of the non-allocatable archive
pub const DEFAULT_NON_ALLOCATABLE_ARCHIVE: &str = "non-allocatable.rrd";

/// Archives found in a collector's data volume
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterArchives {
    /// Archives whose values are summed into used CPU and memory
    pub used: Vec<PathBuf>,
    /// Archive holding the non-allocatable baseline
    pub non_allocatable: Option<PathBuf>,
}

/// Knows how to classify the archives in a data volume
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    non_allocatable_file: String,
}

impl Default for ArchiveLayout {
    fn default() -> Self {
        Self::new(DEFAULT_NON_ALLOCATABLE_ARCHIVE)
    }
}

impl ArchiveLayout {
    pub fn new(non_allocatable_file: impl Into<String>) -> Self {
        Self {
            non_allocatable_file: non_allocatable_file.into(),
        }
    }

    pub fn non_allocatable_file(&self) -> &str {
        &self.non_allocatable_file
    }

    /// List archives in `data_dir`. A missing directory yields no archives.
    pub fn discover(&self, data_dir: &Path) -> std::io::Result<ClusterArchives> {
        let entries = match std::fs::read_dir(data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ClusterArchives::default())
            }
            Err(e) => return Err(e),
        };

        let mut archives = ClusterArchives::default();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXTENSION)
            {
                continue;
            }
            let is_baseline = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n == self.non_allocatable_file)
                .unwrap_or(false);
            if is_baseline {
                archives.non_allocatable = Some(path);
            } else {
                archives.used.push(path);
            }
        }
        archives.used.sort();
        Ok(archives)
    }
}

/// Latest trustworthy reading of one archive
#[derive(Debug, Clone, Copy, PartialEq)]
struct ArchiveReading {
    cpu: f64,
    mem: f64,
    fresh: bool,
}

/// Computes one usage snapshot per cluster from its collector's archives
#[derive(Debug, Clone)]
pub struct ClusterUsageSnapshotter {
    layout: ArchiveLayout,
    step_secs: u64,
}

impl ClusterUsageSnapshotter {
    pub fn new(layout: ArchiveLayout, step_secs: u64) -> Self {
        Self { layout, step_secs }
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    /// Snapshot the archives in a collector's data volume
    pub fn snapshot(&self, cluster_name: &str, data_dir: &Path, now: DateTime<Utc>) -> UsageSnapshot {
        match self.layout.discover(data_dir) {
            Ok(archives) => self.snapshot_archives(cluster_name, &archives, now),
            Err(e) => {
                warn!(
                    cluster = %cluster_name,
                    data_dir = %data_dir.display(),
                    error = %e,
                    "Failed to list collector archives"
                );
                UsageSnapshot::out_of_date(cluster_name)
            }
        }
    }

    /// Snapshot an already classified set of archives.
    ///
    /// The result is out of date unless every archive was updated inside the
    /// window `[now - 2 step, now]` and the non-allocatable CPU and memory are
    /// both strictly positive.
    pub fn snapshot_archives(
        &self,
        cluster_name: &str,
        archives: &ClusterArchives,
        now: DateTime<Utc>,
    ) -> UsageSnapshot {
        let Some(baseline_path) = archives.non_allocatable.as_deref() else {
            debug!(cluster = %cluster_name, "No non-allocatable archive yet");
            return UsageSnapshot::out_of_date(cluster_name);
        };

        let window_start = now - Duration::seconds(2 * self.step_secs as i64);

        let Some(baseline) = self.read(cluster_name, baseline_path, window_start, now) else {
            return UsageSnapshot::out_of_date(cluster_name);
        };

        let mut snapshot = UsageSnapshot {
            cluster_name: cluster_name.to_string(),
            cpu_used: 0.0,
            mem_used: 0.0,
            cpu_non_allocatable: baseline.cpu,
            mem_non_allocatable: baseline.mem,
            out_of_date: !baseline.fresh,
        };

        for path in &archives.used {
            match self.read(cluster_name, path, window_start, now) {
                Some(reading) => {
                    snapshot.cpu_used += reading.cpu;
                    snapshot.mem_used += reading.mem;
                    snapshot.out_of_date |= !reading.fresh;
                }
                None => snapshot.out_of_date = true,
            }
        }

        // A non-positive baseline means the collector is incomplete or misconfigured
        if snapshot.cpu_non_allocatable <= 0.0 || snapshot.mem_non_allocatable <= 0.0 {
            snapshot.out_of_date = true;
        }

        snapshot
    }

    fn read(
        &self,
        cluster_name: &str,
        path: &Path,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<ArchiveReading> {
        let archive = match Archive::open(path) {
            Ok(archive) => archive,
            Err(e) => {
                warn!(cluster = %cluster_name, error = %e, "Failed to open collector archive");
                return None;
            }
        };

        let fresh = archive
            .last_update()
            .map(|t| t >= window_start && t <= now)
            .unwrap_or(false);

        let mut reading = ArchiveReading {
            cpu: 0.0,
            mem: 0.0,
            fresh,
        };
        for (_, [cpu, mem]) in archive.fetch(window_start, now, archive.step()).rows() {
            if cpu.is_nan() || mem.is_nan() || cpu < 0.0 || mem < 0.0 {
                continue;
            }
            reading.cpu = cpu;
            reading.mem = mem;
        }

        Some(reading)
    }
}
