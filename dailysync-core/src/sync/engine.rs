//! Sync engine: gap dates in, per-date outcomes out.
//!
//! For every gap date the engine re-checks the gap, fetches from the source
//! with a bounded number of attempts, maps rows through the configured
//! `FieldMapping` and merges them in `InsertOnly` mode. One failing date
//! never stops the others; storage failures are flagged separately so the
//! caller can escalate.

use std::fmt;
use std::thread;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use thiserror::Error;
use tracing::{debug, warn};

use super::gaps::{EntityScope, GapDetector};
use super::progress::{LogProgress, SyncProgress};
use crate::data::{DataSourceAdapter, FieldMapping, SourceError};
use crate::store::{StoreError, TimeSeriesStore, WriteMode};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source failed after {attempts} attempt(s): {last}")]
    SourceExhausted { attempts: u32, last: SourceError },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl SyncError {
    pub fn is_storage(&self) -> bool {
        matches!(self, SyncError::Storage(_))
    }
}

/// Fixed-delay retry bound for source fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// What happened to one gap date. Never persisted.
#[derive(Debug)]
pub struct SyncOutcome {
    pub date: NaiveDate,
    /// Whether the source was called. False when the date was filled by
    /// someone else between gap detection and the fetch.
    pub attempted: bool,
    /// Fetch calls made, including retries.
    pub attempts: u32,
    pub rows_fetched: usize,
    pub rows_written: u64,
    /// Rows the mapping could not turn into records.
    pub rows_rejected: usize,
    pub error: Option<SyncError>,
}

impl SyncOutcome {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            attempted: false,
            attempts: 0,
            rows_fetched: 0,
            rows_written: 0,
            rows_rejected: 0,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_storage_error(&self) -> bool {
        self.error.as_ref().is_some_and(SyncError::is_storage)
    }
}

/// Totals over a set of outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub dates: usize,
    pub dates_with_rows: usize,
    pub rows_written: u64,
    pub rows_rejected: usize,
    pub source_failures: usize,
    pub storage_failures: usize,
}

impl SyncSummary {
    pub fn from_outcomes(outcomes: &[SyncOutcome]) -> Self {
        let mut summary = Self {
            dates: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            if outcome.rows_fetched > 0 {
                summary.dates_with_rows += 1;
            }
            summary.rows_written += outcome.rows_written;
            summary.rows_rejected += outcome.rows_rejected;
            match &outcome.error {
                Some(SyncError::Storage(_)) => summary.storage_failures += 1,
                Some(SyncError::SourceExhausted { .. }) => summary.source_failures += 1,
                None => {}
            }
        }
        summary
    }

    pub fn all_succeeded(&self) -> bool {
        self.source_failures == 0 && self.storage_failures == 0
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} date(s) checked, {} with data, {} row(s) written",
            self.dates, self.dates_with_rows, self.rows_written
        )?;
        if self.rows_rejected > 0 {
            write!(f, ", {} row(s) rejected", self.rows_rejected)?;
        }
        if self.source_failures > 0 {
            write!(f, ", {} source failure(s)", self.source_failures)?;
        }
        if self.storage_failures > 0 {
            write!(f, ", {} storage failure(s)", self.storage_failures)?;
        }
        Ok(())
    }
}

/// Drives gap detection, fetching and merging for one run.
///
/// Holds only borrowed collaborators; all record state stays in the store.
pub struct SyncEngine<'a> {
    store: &'a dyn TimeSeriesStore,
    source: &'a dyn DataSourceAdapter,
    mapping: &'a FieldMapping,
    retry: RetryPolicy,
    scope: EntityScope,
    progress: &'a dyn SyncProgress,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        store: &'a dyn TimeSeriesStore,
        source: &'a dyn DataSourceAdapter,
        mapping: &'a FieldMapping,
    ) -> Self {
        Self {
            store,
            source,
            mapping,
            retry: RetryPolicy::default(),
            scope: EntityScope::AllEntities,
            progress: &LogProgress,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_scope(mut self, scope: EntityScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn SyncProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Sync the lookback window ending today (local time).
    pub fn sync(
        &self,
        lookback_days: u32,
        min_rows_threshold: u64,
    ) -> Result<Vec<SyncOutcome>, StoreError> {
        self.sync_as_of(Local::now().date_naive(), lookback_days, min_rows_threshold)
    }

    /// Sync the lookback window ending at `as_of`.
    ///
    /// Gap dates are processed oldest first. The outer `Err` only reports a
    /// failure of gap detection itself; per-date failures live in the
    /// outcomes.
    pub fn sync_as_of(
        &self,
        as_of: NaiveDate,
        lookback_days: u32,
        min_rows_threshold: u64,
    ) -> Result<Vec<SyncOutcome>, StoreError> {
        let detector = GapDetector::new(self.store);
        let mut gaps = detector.find_gaps(&self.scope, lookback_days, min_rows_threshold, as_of)?;
        self.progress.on_gaps(as_of, &gaps);
        gaps.reverse();

        let total = gaps.len();
        let mut outcomes = Vec::with_capacity(total);
        for (i, date) in gaps.into_iter().enumerate() {
            let outcome = self.sync_date(&detector, date, min_rows_threshold);
            self.progress.on_date_complete(&outcome, i, total);
            outcomes.push(outcome);
        }

        self.progress.on_sync_complete(&outcomes);
        Ok(outcomes)
    }

    fn sync_date(&self, detector: &GapDetector<'_>, date: NaiveDate, threshold: u64) -> SyncOutcome {
        let mut outcome = SyncOutcome::new(date);

        match detector.is_gap(&self.scope, date, threshold) {
            Ok(true) => {}
            Ok(false) => {
                debug!(%date, "date filled since gap detection, skipping fetch");
                return outcome;
            }
            Err(e) => {
                outcome.error = Some(SyncError::Storage(e));
                return outcome;
            }
        }

        outcome.attempted = true;
        let rows = match self.fetch_with_retry(date, &mut outcome.attempts) {
            Ok(rows) => rows,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };
        outcome.rows_fetched = rows.len();
        if rows.is_empty() {
            debug!(%date, source = self.source.name(), "source returned no rows");
            return outcome;
        }

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.mapping.map_row(date, row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(%date, error = %e, "rejected source row");
                    outcome.rows_rejected += 1;
                }
            }
        }

        match self.store.upsert_batch(&records, WriteMode::InsertOnly) {
            Ok(written) => outcome.rows_written = written,
            Err(e) => outcome.error = Some(SyncError::Storage(e)),
        }
        outcome
    }

    fn fetch_with_retry(
        &self,
        date: NaiveDate,
        attempts: &mut u32,
    ) -> Result<Vec<crate::data::SourceRow>, SyncError> {
        loop {
            *attempts += 1;
            match self.source.fetch(date) {
                Ok(rows) => return Ok(rows),
                Err(e) if *attempts < self.retry.max_attempts => {
                    warn!(
                        %date,
                        source = self.source.name(),
                        attempt = *attempts,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "fetch failed, retrying"
                    );
                    if !self.retry.delay.is_zero() {
                        thread::sleep(self.retry.delay);
                    }
                }
                Err(e) => {
                    return Err(SyncError::SourceExhausted {
                        attempts: *attempts,
                        last: e,
                    })
                }
            }
        }
    }
}
