//! Usage snapshots and their consolidation into history

mod consolidation;
mod snapshot;

#[cfg(test)]
mod tests;

pub use consolidation::{ConsolidationConfig, ConsolidationLoop, TickReport};
pub use snapshot::{
    ArchiveLayout, ClusterArchives, ClusterUsageSnapshotter, DEFAULT_NON_ALLOCATABLE_ARCHIVE,
};
