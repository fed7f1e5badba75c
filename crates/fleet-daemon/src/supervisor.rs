//! Waiting on the daemon's long-running tasks

use fleet_lib::fleet::FleetError;
use std::future::Future;
use tokio::task::{JoinError, JoinHandle};
use tracing::error;

pub type ReconcilerJoin = Result<Result<(), FleetError>, JoinError>;
pub type ApiJoin = Result<anyhow::Result<()>, JoinError>;

/// Why the daemon stopped waiting
#[derive(Debug)]
pub enum ExitCause {
    Signal,
    Reconciler(ReconcilerJoin),
    Api(ApiJoin),
}

impl ExitCause {
    pub fn reason(&self) -> &'static str {
        match self {
            ExitCause::Signal => "signal received",
            ExitCause::Reconciler(_) => "reconciler stopped",
            ExitCause::Api(_) => "API server stopped",
        }
    }
}

/// Wait until `signal` fires or either task finishes, whichever comes first
pub async fn wait_for_exit(
    signal: impl Future<Output = ()>,
    reconciler: &mut JoinHandle<Result<(), FleetError>>,
    api: &mut JoinHandle<anyhow::Result<()>>,
) -> ExitCause {
    tokio::select! {
        _ = signal => ExitCause::Signal,
        joined = reconciler => ExitCause::Reconciler(joined),
        joined = api => {
            if let Ok(Err(e)) = &joined {
                error!(error = %format!("{:#}", e), "API server failed");
            }
            ExitCause::Api(joined)
        }
    }
}
