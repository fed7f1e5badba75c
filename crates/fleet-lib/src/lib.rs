//! Fleet usage tracking library
//!
//! This crate provides the core functionality for:
//! - Round-robin time-series archives
//! - Freshness-checked usage snapshots and their consolidation into history
//! - Hourly and monthly rollups of historical usage
//! - The durable instance registry and fleet reconciliation
//! - Health checks and observability

pub mod fleet;
pub mod health;
pub mod models;
pub mod observability;
pub mod paths;
pub mod persist;
pub mod query;
pub mod registry;
pub mod rollup;
pub mod tsdb;
pub mod usage;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{FleetMetrics, StructuredLogger};
pub use paths::FleetPaths;
pub use registry::{InstanceRegistry, RegistryState};
pub use rollup::{Period, UsageRollup};
