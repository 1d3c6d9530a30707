//! Per-entity indicator computation against the store.
//!
//! For each window `w` the calculator takes the `w` most recent records up
//! to and including `as_of` and writes `sma_{w}` (and `dev_{w}` when the
//! mean is usable) in `Replace` mode, so corrected inputs overwrite earlier
//! results. Unsatisfied windows write nothing and are reported as skips; any
//! value an earlier run stored under a skipped name is removed.

use chrono::{Duration, NaiveDate};
use tracing::{debug, info};

use super::sma::{deviation_ratio, Sma};
use super::IndicatorError;
use crate::domain::{DatedRecord, IndicatorRecord};
use crate::store::{TimeSeriesStore, WriteMode};

/// Why a window produced no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The entity has no record on the computation date.
    NoRecordOnDate,
    /// Fewer than `w` records exist up to the computation date.
    InsufficientData { available: usize },
    /// A record in the window lacks a numeric value for the field.
    MissingValue,
    /// The mean was written but the deviation is undefined (zero mean or
    /// missing current value).
    UndefinedDeviation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSkip {
    pub window: usize,
    pub reason: SkipReason,
}

/// Result of computing indicators for one entity on one date.
#[derive(Debug, Clone)]
pub struct IndicatorOutcome {
    pub entity: String,
    pub as_of: NaiveDate,
    pub written: Vec<IndicatorRecord>,
    pub skipped: Vec<WindowSkip>,
}

impl IndicatorOutcome {
    fn new(entity: &str, as_of: NaiveDate) -> Self {
        Self {
            entity: entity.to_string(),
            as_of,
            written: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Every window produced a mean.
    pub fn is_complete(&self) -> bool {
        self.skipped
            .iter()
            .all(|s| s.reason == SkipReason::UndefinedDeviation)
    }
}

/// Result of `compute_all`.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub as_of: NaiveDate,
    pub outcomes: Vec<IndicatorOutcome>,
}

impl BatchOutcome {
    pub fn entities(&self) -> usize {
        self.outcomes.len()
    }

    pub fn records_written(&self) -> usize {
        self.outcomes.iter().map(|o| o.written.len()).sum()
    }

    pub fn complete_entities(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_complete()).count()
    }
}

pub struct IndicatorCalculator<'a> {
    store: &'a dyn TimeSeriesStore,
    field: String,
}

impl<'a> IndicatorCalculator<'a> {
    /// Calculator over the numeric payload `field` (e.g. `"close"`).
    pub fn new(store: &'a dyn TimeSeriesStore, field: impl Into<String>) -> Self {
        Self {
            store,
            field: field.into(),
        }
    }

    fn values(&self, records: &[DatedRecord]) -> Vec<Option<f64>> {
        records.iter().map(|r| r.number(&self.field)).collect()
    }

    fn write(&self, record: IndicatorRecord, outcome: &mut IndicatorOutcome) -> Result<(), IndicatorError> {
        self.store.upsert_indicator(&record, WriteMode::Replace)?;
        outcome.written.push(record);
        Ok(())
    }

    /// Drop a value left by an earlier computation over different inputs.
    fn clear(&self, date: NaiveDate, entity: &str, indicator: &str) -> Result<(), IndicatorError> {
        if self.store.delete_indicator(date, entity, indicator)? {
            debug!(entity, %date, indicator, "removed stale indicator");
        }
        Ok(())
    }

    /// Compute every window in `windows` for `entity` on `as_of`.
    pub fn compute(
        &self,
        entity: &str,
        as_of: NaiveDate,
        windows: &[usize],
    ) -> Result<IndicatorOutcome, IndicatorError> {
        let smas = build_smas(windows)?;
        self.compute_with(entity, as_of, &smas)
    }

    fn compute_with(
        &self,
        entity: &str,
        as_of: NaiveDate,
        smas: &[Sma],
    ) -> Result<IndicatorOutcome, IndicatorError> {
        let mut outcome = IndicatorOutcome::new(entity, as_of);
        let longest = smas.iter().map(Sma::period).max().unwrap_or(0);
        let records = self.store.query_latest(entity, as_of, longest)?;

        if records.last().map(|r| r.date) != Some(as_of) {
            outcome.skipped.extend(smas.iter().map(|sma| WindowSkip {
                window: sma.period(),
                reason: SkipReason::NoRecordOnDate,
            }));
            return Ok(outcome);
        }

        let values = self.values(&records);
        let current = values.last().copied().flatten();

        for sma in smas {
            let Some(mean) = sma.window_mean(&values) else {
                let reason = if values.len() < sma.period() {
                    SkipReason::InsufficientData {
                        available: values.len(),
                    }
                } else {
                    SkipReason::MissingValue
                };
                outcome.skipped.push(WindowSkip {
                    window: sma.period(),
                    reason,
                });
                self.clear(as_of, entity, sma.name())?;
                self.clear(as_of, entity, sma.deviation_name())?;
                continue;
            };

            self.write(IndicatorRecord::new(as_of, entity, sma.name(), mean), &mut outcome)?;

            match current.and_then(|c| deviation_ratio(c, mean)) {
                Some(dev) => self.write(
                    IndicatorRecord::new(as_of, entity, sma.deviation_name(), dev),
                    &mut outcome,
                )?,
                None => {
                    outcome.skipped.push(WindowSkip {
                        window: sma.period(),
                        reason: SkipReason::UndefinedDeviation,
                    });
                    self.clear(as_of, entity, sma.deviation_name())?;
                }
            }
        }

        debug!(
            entity,
            %as_of,
            written = outcome.written.len(),
            skipped = outcome.skipped.len(),
            "computed indicators"
        );
        Ok(outcome)
    }

    /// Compute for every entity that has a record on `as_of`.
    ///
    /// Unsatisfied windows are recorded per entity; a storage failure stops
    /// the batch.
    pub fn compute_all(
        &self,
        as_of: NaiveDate,
        windows: &[usize],
    ) -> Result<BatchOutcome, IndicatorError> {
        let smas = build_smas(windows)?;
        let entities = self.store.entities_on(as_of)?;
        let mut outcomes = Vec::with_capacity(entities.len());
        for entity in &entities {
            outcomes.push(self.compute_with(entity, as_of, &smas)?);
        }
        let batch = BatchOutcome { as_of, outcomes };
        info!(
            %as_of,
            entities = batch.entities(),
            complete = batch.complete_entities(),
            records = batch.records_written(),
            "indicator batch complete"
        );
        Ok(batch)
    }

    /// Recompute indicators for every stored date of `entity` in
    /// `from..=to`. Returns the number of indicator records written.
    pub fn backfill(
        &self,
        entity: &str,
        from: NaiveDate,
        to: NaiveDate,
        windows: &[usize],
    ) -> Result<usize, IndicatorError> {
        let smas = build_smas(windows)?;
        if from > to {
            return Ok(0);
        }
        let longest = smas.iter().map(Sma::period).max().unwrap_or(0);

        // History before `from` so the first dates in range have full windows.
        let mut records = match from.checked_sub_signed(Duration::days(1)) {
            Some(before) => self.store.query_latest(entity, before, longest.saturating_sub(1))?,
            None => Vec::new(),
        };
        let lead = records.len();
        records.extend(self.store.query_range(entity, from, to)?);
        let values = self.values(&records);

        let mut scratch = IndicatorOutcome::new(entity, to);
        for sma in &smas {
            let means = sma.rolling(&values);
            for (i, record) in records.iter().enumerate().skip(lead) {
                let Some(mean) = means[i] else {
                    self.clear(record.date, entity, sma.name())?;
                    self.clear(record.date, entity, sma.deviation_name())?;
                    continue;
                };
                self.write(
                    IndicatorRecord::new(record.date, entity, sma.name(), mean),
                    &mut scratch,
                )?;
                match values[i].and_then(|c| deviation_ratio(c, mean)) {
                    Some(dev) => self.write(
                        IndicatorRecord::new(record.date, entity, sma.deviation_name(), dev),
                        &mut scratch,
                    )?,
                    None => self.clear(record.date, entity, sma.deviation_name())?,
                }
            }
        }
        Ok(scratch.written.len())
    }

    /// `backfill` for every entity with at least one record in `from..=to`.
    pub fn backfill_all(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        windows: &[usize],
    ) -> Result<usize, IndicatorError> {
        let mut written = 0;
        for entity in self.store.entities_between(from, to)? {
            written += self.backfill(&entity, from, to, windows)?;
        }
        info!(%from, %to, records = written, "indicator backfill complete");
        Ok(written)
    }
}

/// Validated, deduplicated, ascending windows.
fn build_smas(windows: &[usize]) -> Result<Vec<Sma>, IndicatorError> {
    if windows.is_empty() {
        return Err(IndicatorError::NoWindows);
    }
    let mut periods = windows.to_vec();
    periods.sort_unstable();
    periods.dedup();
    periods.into_iter().map(Sma::new).collect()
}
