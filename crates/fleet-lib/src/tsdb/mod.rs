//! Round-robin time-series storage
//!
//! Each archive file stores a pair of gauge series at two resolutions: the
//! base step (5 minutes, ~14 days) and hourly rows (~1 year). Archives are
//! append-only at their base step and single-writer by convention; every
//! write replaces the file atomically so readers never see a partial update.

mod archive;


pub use archive::{
    align, Archive, ArchiveInfo, FetchResult, DEFAULT_STEP_SECS, HIGH_RES_ROWS,
    LOW_RES_ROWS, LOW_RES_STEPS_PER_ROW, SERIES,
};

use std::path::PathBuf;
use thiserror::Error;

/// File extension used for archive files
pub const ARCHIVE_EXTENSION: &str = "rrd";

/// Errors raised by archive operations
#[derive(Debug, Error)]
pub enum TsdbError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?} exists and is not an archive")]
    NotAnArchive { path: PathBuf },

    #[error("corrupt archive {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("stale update on {path:?}: {timestamp} is not after last update {last_update}")]
    StaleUpdate {
        path: PathBuf,
        timestamp: i64,
        last_update: i64,
    },

    #[error("invalid archive step: {0}")]
    InvalidStep(u64),
}

impl TsdbError {
    /// Stale updates are expected when a tick fires twice within one step
    pub fn is_stale_update(&self) -> bool {
        matches!(self, TsdbError::StaleUpdate { .. })
    }
}

/// Result type alias for archive operations
pub type Result<T> = std::result::Result<T, TsdbError>;
