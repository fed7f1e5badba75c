//! Fleet usage daemon
//!
//! Runs the fleet reconciler and the consolidation loop side by side and
//! serves health, metrics and usage queries over HTTP.

pub mod api;
pub mod config;
pub mod supervisor;
