//! Disk-backed warmup of whole pieces ahead of readers.

pub mod disk_cache;
pub mod eviction;
pub mod queue;

use async_trait::async_trait;

pub use disk_cache::OnDiskPreloadCache;
pub use eviction::{SweepReport, sweep};
pub use queue::{PrefetchQueue, PrefetchQueuePool};

use crate::Result;
use crate::pieces::PieceRequest;

/// Something that can fetch a piece ahead of time.
#[async_trait]
pub trait Preloader: Send + Sync {
    /// Makes the piece locally available. Idempotent per piece.
    ///
    /// # Errors
    ///
    /// Returns the fetch or disk error of the preload, memoized for the
    /// lifetime of the preload entry.
    async fn preload(&self, request: &PieceRequest) -> Result<()>;
}
