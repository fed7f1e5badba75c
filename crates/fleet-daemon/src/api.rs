//! HTTP API for health checks, Prometheus metrics and usage queries

use fleet_lib::{
    health::{ComponentStatus, HealthRegistry},
    models::UsageSnapshot,
    observability::FleetMetrics,
    paths::FleetPaths,
    query::{render_csv, render_csv_all, ClusterSelector, OutputFormat, QueryError, RawUsageQuery},
    registry::InstanceRegistry,
    rollup::{RollupError, UsageRollup},
};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use anyhow::Context;
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: FleetMetrics,
    pub paths: FleetPaths,
    pub rollup: UsageRollup,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: FleetMetrics, paths: FleetPaths) -> Self {
        Self {
            health_registry,
            metrics,
            rollup: UsageRollup::new(paths.clone()),
            paths,
        }
    }
}

/// Structured error payload
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = match self.status {
            StatusCode::BAD_REQUEST => "bad_request",
            StatusCode::NOT_FOUND => "not_found",
            _ => "internal_error",
        };
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "Request failed");
        }
        (
            self.status,
            Json(ErrorBody {
                error,
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: e.to_string(),
        }
    }
}

impl From<RollupError> for ApiError {
    fn from(e: RollupError) -> Self {
        let status = match e {
            RollupError::UnknownCluster(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::internal(format!("failed to encode metrics: {}", e)))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        buffer,
    ))
}

/// Registered monitoring instances and the port counter
async fn instances(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let registry = InstanceRegistry::read_state(&state.paths.registry_file())
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(registry))
}

/// Snapshots written by the last consolidation tick
async fn current_usage(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<UsageSnapshot>>, ApiError> {
    let path = state.paths.current_usage_file();
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Json(Vec::new())),
        Err(e) => return Err(ApiError::internal(format!("failed to read current usage: {}", e))),
    };

    let snapshots = serde_json::from_str(&content)
        .map_err(|e| ApiError::internal(format!("failed to parse current usage: {}", e)))?;
    Ok(Json(snapshots))
}

/// Historical usage at hourly or monthly resolution, as JSON or CSV
async fn usage_history(
    State(state): State<Arc<AppState>>,
    Query(raw): Query<RawUsageQuery>,
) -> Result<Response, ApiError> {
    let query = raw.validate(Utc::now())?;
    let rollup = state.rollup.clone();

    // Archive reads are blocking file I/O
    let response = tokio::task::spawn_blocking(move || -> Result<Response, ApiError> {
        let response = match (&query.cluster, query.format) {
            (ClusterSelector::One(name), OutputFormat::Json) => {
                Json(rollup.fetch(name, query.start, query.end, query.period)?).into_response()
            }
            (ClusterSelector::One(name), OutputFormat::Csv) => {
                csv(render_csv(&rollup.fetch(name, query.start, query.end, query.period)?))
            }
            (ClusterSelector::All, OutputFormat::Json) => {
                Json(rollup.fetch_all(query.start, query.end, query.period)?).into_response()
            }
            (ClusterSelector::All, OutputFormat::Csv) => {
                csv(render_csv_all(&rollup.fetch_all(query.start, query.end, query.period)?))
            }
        };
        Ok(response)
    })
    .await
    .map_err(|e| ApiError::internal(format!("history query aborted: {}", e)))??;

    Ok(response)
}

fn csv(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/instances", get(instances))
        .route("/api/v1/usage/current", get(current_usage))
        .route("/api/v1/usage/history", get(usage_history))
        .with_state(state)
}

/// Start the API server; it stops accepting connections on shutdown
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
