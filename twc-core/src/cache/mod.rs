//! Generic keyed pools with memoized values and deterministic expiry.
//!
//! Every cache in the pipeline is a [`Pool`] of [`Once`] cells: the first
//! caller for a key runs the load, concurrent callers wait on the same cell,
//! and a single reaper task per pool removes expired entries.

pub mod clock;
pub mod once;
pub mod pool;

pub use clock::{Clock, SystemClock};
#[cfg(any(test, feature = "test-utils"))]
pub use clock::ManualClock;
pub use once::Once;
pub use pool::{Expiry, Pool, spawn_reaper};
