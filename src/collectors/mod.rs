//! Polling collectors. Each one is a unit of work the daemon schedules on a
//! fixed interval: paginate → normalize → validate → bulk-write.

pub mod books;
pub mod metadata;
pub mod normalize;
pub mod prices;
pub mod resolutions;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use books::BookCollector;
pub use metadata::MetadataCollector;
pub use prices::PriceCollector;
pub use resolutions::ResolutionCollector;

/// One poll cycle. Returns the number of rows ingested.
///
/// Contract: `Err` is reserved for cycle-level failures (upstream transport
/// down, storage write failed) and is absorbed by the unit runner, which logs
/// and counts it. A malformed individual record is skipped with a
/// warning, not an error. Implementations hold no cross-call mutable state,
/// so the same instance is safely re-scheduled after a crash-restart.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sleep between cycles. Cycles never overlap: the runner awaits
    /// `collect_once` before the next tick.
    fn interval(&self) -> Duration;

    async fn collect_once(&self) -> Result<usize>;
}
