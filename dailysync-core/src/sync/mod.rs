//! Incremental synchronization: find under-populated dates, fetch them with
//! bounded retries and merge the rows idempotently into the store.

pub mod engine;
pub mod gaps;
pub mod progress;

pub use engine::{RetryPolicy, SyncEngine, SyncError, SyncOutcome, SyncSummary};
pub use gaps::{EntityScope, GapDetector};
pub use progress::{LogProgress, SyncProgress};
