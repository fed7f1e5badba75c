//! Snapshot freshness and consolidation tests against real archive files

use super::*;
use crate::models::{AuthType, Instance, UsageSnapshot};
use crate::paths::FleetPaths;
use crate::registry::{InstanceRegistry, RegistryError};
use crate::tsdb::{Archive, DEFAULT_STEP_SECS};
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const STEP: i64 = DEFAULT_STEP_SECS as i64;

/// Tick time, aligned to an hour boundary
const NOW: i64 = 1_600_002_000 - 1_600_002_000 % 3600;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn write_archive(dir: &Path, file: &str, samples: &[(i64, f64, f64)]) {
    let mut archive = Archive::create(dir.join(file), DEFAULT_STEP_SECS).unwrap();
    for &(t, cpu, mem) in samples {
        archive.append(ts(t), cpu, mem).unwrap();
    }
}

fn snapshotter() -> ClusterUsageSnapshotter {
    ClusterUsageSnapshotter::new(ArchiveLayout::default(), DEFAULT_STEP_SECS)
}

/// Collector output with a healthy baseline and two used archives
fn fresh_collector(dir: &Path) {
    write_archive(
        dir,
        DEFAULT_NON_ALLOCATABLE_ARCHIVE,
        &[(NOW - STEP, 0.5, 100.0), (NOW, 0.5, 100.0)],
    );
    write_archive(dir, "pods.rrd", &[(NOW - STEP, 1.0, 200.0), (NOW, 2.0, 400.0)]);
    write_archive(dir, "system.rrd", &[(NOW, 0.25, 50.0)]);
}

#[test]
fn test_discover_separates_baseline() {
    let dir = TempDir::new().unwrap();
    fresh_collector(dir.path());
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let archives = ArchiveLayout::default().discover(dir.path()).unwrap();
    assert_eq!(
        archives.non_allocatable,
        Some(dir.path().join(DEFAULT_NON_ALLOCATABLE_ARCHIVE))
    );
    assert_eq!(
        archives.used,
        vec![dir.path().join("pods.rrd"), dir.path().join("system.rrd")]
    );
}

#[test]
fn test_discover_custom_baseline_name() {
    let dir = TempDir::new().unwrap();
    write_archive(dir.path(), "reserved.rrd", &[(NOW, 1.0, 1.0)]);
    write_archive(dir.path(), DEFAULT_NON_ALLOCATABLE_ARCHIVE, &[(NOW, 1.0, 1.0)]);

    let archives = ArchiveLayout::new("reserved.rrd").discover(dir.path()).unwrap();
    assert_eq!(archives.non_allocatable, Some(dir.path().join("reserved.rrd")));
    assert_eq!(archives.used.len(), 1);
}

#[test]
fn test_discover_missing_directory() {
    let dir = TempDir::new().unwrap();
    let archives = ArchiveLayout::default()
        .discover(&dir.path().join("absent"))
        .unwrap();
    assert_eq!(archives, ClusterArchives::default());
}

#[test]
fn test_fresh_snapshot_sums_used_archives() {
    let dir = TempDir::new().unwrap();
    fresh_collector(dir.path());

    let snapshot = snapshotter().snapshot("prod", dir.path(), ts(NOW));
    assert!(!snapshot.out_of_date);
    assert_eq!(snapshot.cluster_name, "prod");
    assert_eq!(snapshot.cpu_used, 2.25);
    assert_eq!(snapshot.mem_used, 450.0);
    assert_eq!(snapshot.cpu_non_allocatable, 0.5);
    assert_eq!(snapshot.mem_non_allocatable, 100.0);
}

#[test]
fn test_stale_archive_marks_out_of_date() {
    let dir = TempDir::new().unwrap();
    fresh_collector(dir.path());
    write_archive(dir.path(), "lagging.rrd", &[(NOW - 3 * STEP, 1.0, 1.0)]);

    let snapshot = snapshotter().snapshot("prod", dir.path(), ts(NOW));
    assert!(snapshot.out_of_date);
}

#[test]
fn test_non_positive_baseline_marks_out_of_date() {
    for (cpu, mem) in [(0.0, 100.0), (0.5, 0.0), (-1.0, -1.0)] {
        let dir = TempDir::new().unwrap();
        write_archive(dir.path(), DEFAULT_NON_ALLOCATABLE_ARCHIVE, &[(NOW, cpu, mem)]);
        write_archive(dir.path(), "pods.rrd", &[(NOW, 1.0, 1.0)]);

        let snapshot = snapshotter().snapshot("prod", dir.path(), ts(NOW));
        assert!(snapshot.out_of_date, "baseline ({}, {})", cpu, mem);
    }
}

#[test]
fn test_missing_baseline_marks_out_of_date() {
    let dir = TempDir::new().unwrap();
    write_archive(dir.path(), "pods.rrd", &[(NOW, 1.0, 1.0)]);

    let snapshot = snapshotter().snapshot("prod", dir.path(), ts(NOW));
    assert_eq!(snapshot, UsageSnapshot::out_of_date("prod"));
}

#[test]
fn test_unreadable_archive_marks_out_of_date() {
    let dir = TempDir::new().unwrap();
    fresh_collector(dir.path());
    std::fs::write(dir.path().join("garbage.rrd"), b"not an archive").unwrap();

    let snapshot = snapshotter().snapshot("prod", dir.path(), ts(NOW));
    assert!(snapshot.out_of_date);
}

#[test]
fn test_negative_and_nan_rows_are_skipped() {
    let dir = TempDir::new().unwrap();
    write_archive(
        dir.path(),
        DEFAULT_NON_ALLOCATABLE_ARCHIVE,
        &[(NOW - STEP, 0.5, 100.0), (NOW, 0.5, 100.0)],
    );
    write_archive(
        dir.path(),
        "pods.rrd",
        &[(NOW - STEP, 3.0, 300.0), (NOW, -1.0, f64::NAN)],
    );

    let snapshot = snapshotter().snapshot("prod", dir.path(), ts(NOW));
    assert!(!snapshot.out_of_date);
    assert_eq!(snapshot.cpu_used, 3.0);
    assert_eq!(snapshot.mem_used, 300.0);
}

fn register(paths: &FleetPaths, clusters: &[&str]) {
    let mut registry = InstanceRegistry::load(paths.registry_file()).unwrap();
    for cluster in clusters {
        let port = registry.allocate_port().unwrap();
        registry
            .register(Instance {
                id: format!("id-{}", cluster),
                name: format!("usage-collector-{}", cluster),
                image: "collector:latest".to_string(),
                host_port: port,
                container_port: 5483,
                cluster_name: cluster.to_string(),
                cluster_endpoint: "https://example:6443".to_string(),
                data_volume_path: paths.data_volume(cluster).to_string_lossy().into_owned(),
                credential_volume_path: paths
                    .credential_volume(cluster)
                    .to_string_lossy()
                    .into_owned(),
                auth_type: AuthType::BearerToken,
                creation_timestamp: ts(NOW),
            })
            .unwrap();
    }
    registry.save().unwrap();
}

fn consolidation_loop(paths: &FleetPaths) -> ConsolidationLoop {
    ConsolidationLoop::new(paths.clone(), snapshotter(), ConsolidationConfig::default())
}

fn read_current_usage(paths: &FleetPaths) -> Vec<UsageSnapshot> {
    serde_json::from_str(&std::fs::read_to_string(paths.current_usage_file()).unwrap()).unwrap()
}

#[test]
fn test_tick_commits_totals_and_skips_out_of_date() {
    let dir = TempDir::new().unwrap();
    let paths = FleetPaths::new(dir.path());
    paths.ensure().unwrap();
    register(&paths, &["prod", "staging"]);
    fresh_collector(&paths.data_volume("prod"));

    let report = consolidation_loop(&paths).tick(ts(NOW)).unwrap();
    assert_eq!(report.clusters, 2);
    assert_eq!(report.committed, 1);
    assert_eq!(report.out_of_date, 1);
    assert_eq!(report.failed, 0);
    assert!(report.current_usage_written);

    let current = read_current_usage(&paths);
    assert_eq!(current.len(), 2);
    assert_eq!(current[0].cluster_name, "prod");
    assert!(!current[0].out_of_date);
    assert!(current[1].out_of_date);

    let history = Archive::open(paths.history_archive("prod")).unwrap();
    let fetched = history.fetch(ts(NOW), ts(NOW), DEFAULT_STEP_SECS);
    let cpu: Vec<f64> = fetched.series(0).map(|(_, v)| v).collect();
    let mem: Vec<f64> = fetched.series(1).map(|(_, v)| v).collect();
    assert_eq!(cpu, vec![2.75]);
    assert_eq!(mem, vec![550.0]);

    assert!(!paths.history_archive("staging").exists());
}

#[test]
fn test_repeated_tick_is_stale_not_failed() {
    let dir = TempDir::new().unwrap();
    let paths = FleetPaths::new(dir.path());
    register(&paths, &["prod"]);
    fresh_collector(&paths.data_volume("prod"));
    let consolidation = consolidation_loop(&paths);

    assert_eq!(consolidation.tick(ts(NOW)).unwrap().committed, 1);

    let report = consolidation.tick(ts(NOW)).unwrap();
    assert_eq!(report.committed, 0);
    assert_eq!(report.stale, 1);
    assert_eq!(report.failed, 0);
}

#[test]
fn test_commit_failure_is_isolated() {
    let dir = TempDir::new().unwrap();
    let paths = FleetPaths::new(dir.path());
    register(&paths, &["broken", "prod"]);
    fresh_collector(&paths.data_volume("broken"));
    fresh_collector(&paths.data_volume("prod"));
    std::fs::create_dir_all(paths.history_archive("broken")).unwrap();

    let report = consolidation_loop(&paths).tick(ts(NOW)).unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.committed, 1);
    assert!(paths.history_archive("prod").is_file());
}

#[test]
fn test_tick_with_empty_registry_writes_empty_current_usage() {
    let dir = TempDir::new().unwrap();
    let paths = FleetPaths::new(dir.path());

    let report = consolidation_loop(&paths).tick(ts(NOW)).unwrap();
    assert_eq!(report.clusters, 0);
    assert!(read_current_usage(&paths).is_empty());
    assert!(!paths.registry_file().exists());
}

#[test]
fn test_tick_fails_on_corrupt_registry() {
    let dir = TempDir::new().unwrap();
    let paths = FleetPaths::new(dir.path());
    std::fs::write(paths.registry_file(), "{ broken").unwrap();

    assert!(consolidation_loop(&paths).tick(ts(NOW)).is_err());
}

#[tokio::test]
async fn test_tick_blocking_runs_off_the_async_worker() {
    let dir = TempDir::new().unwrap();
    let paths = FleetPaths::new(dir.path());
    register(&paths, &["prod"]);
    fresh_collector(&paths.data_volume("prod"));
    let consolidation = Arc::new(consolidation_loop(&paths));

    let report = consolidation.clone().tick_blocking(ts(NOW)).await.unwrap();
    assert_eq!(report.committed, 1);
    assert!(paths.history_archive("prod").is_file());

    std::fs::write(paths.registry_file(), "{ broken").unwrap();
    let err = consolidation.tick_blocking(ts(NOW)).await.unwrap_err();
    assert!(err.downcast_ref::<RegistryError>().is_some());
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let paths = FleetPaths::new(dir.path());
    let config = ConsolidationConfig {
        interval: Duration::from_millis(10),
        step_secs: DEFAULT_STEP_SECS,
    };
    let consolidation = ConsolidationLoop::new(paths.clone(), snapshotter(), config)
        .with_health(crate::health::HealthRegistry::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = tokio::spawn(consolidation.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(()).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop did not stop")
        .unwrap();
    assert!(paths.current_usage_file().exists());
}
