//! Integration tests for the daemon API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use fleet_daemon::api::{create_router, AppState};
use fleet_lib::{
    health::{components, HealthRegistry},
    models::UsageSnapshot,
    observability::FleetMetrics,
    paths::FleetPaths,
    persist::write_atomic,
    tsdb::{Archive, DEFAULT_STEP_SECS},
};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>, TempDir) {
    let dir = TempDir::new().unwrap();

    let health_registry = HealthRegistry::new();
    health_registry.register(components::RECONCILER).await;
    health_registry.register(components::CONSOLIDATOR).await;

    let metrics = FleetMetrics::new();
    let state = Arc::new(AppState::new(
        health_registry,
        metrics,
        FleetPaths::new(dir.path()),
    ));
    let router = create_router(state.clone());

    (router, state, dir)
}

async fn get(app: Router, uri: &str) -> (StatusCode, String, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap().to_string())
        .unwrap_or_default();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    (status, content_type, body.to_vec())
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, _, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

/// History for `prod` with two native rows on 2020-01-01
fn seed_history(paths: &FleetPaths) {
    let mut archive = Archive::create(paths.history_archive("prod"), DEFAULT_STEP_SECS).unwrap();
    let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    archive.append(t0, 1.5, 1024.0).unwrap();
    archive
        .append(t0 + chrono::Duration::minutes(5), 2.5, 2048.0)
        .unwrap();
}

const HISTORY_RANGE: &str = "start=2020-01-01T00:00:00&end=2020-01-01T02:00:00";

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state, _dir) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["reconciler"].is_object());
    assert!(health["components"]["consolidator"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state, _dir) = setup_test_app().await;

    state
        .health_registry
        .report_tick(components::CONSOLIDATOR, 1, 4)
        .await;

    // Degraded still returns 200 (operational)
    let (status, health) = get_json(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["consolidator"]["message"],
        "1 of 4 clusters failed"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state, _dir) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::RECONCILER, "cluster discovery failed")
        .await;

    let (status, health) = get_json(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_readiness() {
    let (app, state, _dir) = setup_test_app().await;

    let (status, readiness) = get_json(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    state.health_registry.set_ready(true).await;
    let (status, readiness) = get_json(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state, _dir) = setup_test_app().await;

    state.metrics.inc_reconcile_rounds();
    state.metrics.set_instances_managed(3);
    state.metrics.observe_consolidation_latency(0.004);

    let (status, content_type, body) = get(app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.contains("text/plain"));

    let metrics_text = String::from_utf8(body).unwrap();
    assert!(metrics_text.contains("fleet_reconcile_rounds_total"));
    assert!(metrics_text.contains("fleet_instances_managed"));
    assert!(metrics_text.contains("fleet_consolidation_latency_seconds_bucket"));
}

#[tokio::test]
async fn test_instances_on_fresh_state() {
    let (app, _state, _dir) = setup_test_app().await;

    let (status, body) = get_json(app, "/api/v1/instances").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nextHostPort"], 49000);
    assert_eq!(body["instances"], serde_json::json!([]));
}

#[tokio::test]
async fn test_current_usage() {
    let (app, state, _dir) = setup_test_app().await;

    let (status, body) = get_json(app.clone(), "/api/v1/usage/current").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));

    let snapshots = vec![UsageSnapshot {
        cluster_name: "prod".to_string(),
        cpu_used: 2.0,
        mem_used: 100.0,
        cpu_non_allocatable: 0.5,
        mem_non_allocatable: 10.0,
        out_of_date: false,
    }];
    write_atomic(
        &state.paths.current_usage_file(),
        &serde_json::to_vec(&snapshots).unwrap(),
    )
    .unwrap();

    let (status, body) = get_json(app, "/api/v1/usage/current").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["clusterName"], "prod");
    assert_eq!(body[0]["cpuNonAllocatable"], 0.5);
    assert_eq!(body[0]["outOfDate"], false);
}

#[tokio::test]
async fn test_history_json_for_one_cluster() {
    let (app, state, _dir) = setup_test_app().await;
    seed_history(&state.paths);

    let (status, body) = get_json(
        app,
        &format!("/api/v1/usage/history?cluster=prod&{}", HISTORY_RANGE),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cpu"].as_array().unwrap().len(), 2);
    assert_eq!(body["cpu"][0]["value"], 1.5);
    assert_eq!(body["mem"][1]["value"], 2048.0);
}

#[tokio::test]
async fn test_history_csv_for_one_cluster() {
    let (app, state, _dir) = setup_test_app().await;
    seed_history(&state.paths);

    let (status, content_type, body) = get(
        app,
        &format!("/api/v1/usage/history?cluster=prod&format=csv&{}", HISTORY_RANGE),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("text/csv"));
    assert_eq!(
        String::from_utf8(body).unwrap(),
        "timestamp,cpu,memory\n2020-01-01T00:00:00,1.5,1024\n2020-01-01T00:05:00,2.5,2048\n"
    );
}

#[tokio::test]
async fn test_history_for_all_clusters() {
    let (app, state, _dir) = setup_test_app().await;
    seed_history(&state.paths);

    let (status, body) = get_json(app, &format!("/api/v1/usage/history?{}", HISTORY_RANGE)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["prod"]["cpu"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_history_unknown_cluster_is_404() {
    let (app, _state, _dir) = setup_test_app().await;

    let (status, body) = get_json(app, "/api/v1/usage/history?cluster=missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_history_rejects_bad_input() {
    let (app, _state, _dir) = setup_test_app().await;

    for query in [
        "format=xml",
        "period=daily",
        "start=yesterday",
        "start=2020-02-02T00:00:00&end=2020-02-01T00:00:00",
    ] {
        let (status, body) =
            get_json(app.clone(), &format!("/api/v1/usage/history?{}", query)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "query {}", query);
        assert_eq!(body["error"], "bad_request");
        assert!(body["message"].is_string());
    }
}

#[tokio::test]
async fn test_serve_fails_when_port_is_taken() {
    let (_app, state, _dir) = setup_test_app().await;
    let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        fleet_daemon::api::serve(port, state, shutdown_rx),
    )
    .await
    .expect("serve should return instead of hanging");

    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to bind API server"));
}
