//! Progress callbacks for sync runs.

use chrono::NaiveDate;
use tracing::{info, warn};

use super::engine::SyncOutcome;

pub trait SyncProgress: Send + Sync {
    /// Called once gap detection has finished.
    fn on_gaps(&self, as_of: NaiveDate, gaps: &[NaiveDate]);

    /// Called when a date has been processed, successfully or not.
    fn on_date_complete(&self, outcome: &SyncOutcome, index: usize, total: usize);

    /// Called when every gap date has been processed.
    fn on_sync_complete(&self, outcomes: &[SyncOutcome]);
}

/// Reports progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl SyncProgress for LogProgress {
    fn on_gaps(&self, as_of: NaiveDate, gaps: &[NaiveDate]) {
        if gaps.is_empty() {
            info!(%as_of, "no gaps in lookback window");
        } else {
            info!(%as_of, count = gaps.len(), "found dates to sync");
        }
    }

    fn on_date_complete(&self, outcome: &SyncOutcome, index: usize, total: usize) {
        let position = format!("{}/{}", index + 1, total);
        match &outcome.error {
            None => info!(
                date = %outcome.date,
                position = %position,
                fetched = outcome.rows_fetched,
                written = outcome.rows_written,
                rejected = outcome.rows_rejected,
                "date synced"
            ),
            Some(e) => warn!(date = %outcome.date, position = %position, error = %e, "date failed"),
        }
    }

    fn on_sync_complete(&self, outcomes: &[SyncOutcome]) {
        let summary = super::SyncSummary::from_outcomes(outcomes);
        info!(%summary, "sync complete");
    }
}
