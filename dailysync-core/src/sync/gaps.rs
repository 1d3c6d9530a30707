//! Gap detection over a trailing window of calendar days.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::store::{StoreError, TimeSeriesStore};

/// Which records count towards a date's population.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntityScope {
    /// Every record on the date counts.
    #[default]
    AllEntities,
    /// Only the listed entities count, each at most once.
    Entities(Vec<String>),
}

pub struct GapDetector<'a> {
    store: &'a dyn TimeSeriesStore,
}

impl<'a> GapDetector<'a> {
    pub fn new(store: &'a dyn TimeSeriesStore) -> Self {
        Self { store }
    }

    /// Population of `date` under `scope`.
    pub fn population(&self, scope: &EntityScope, date: NaiveDate) -> Result<u64, StoreError> {
        match scope {
            EntityScope::AllEntities => self.store.count(date),
            EntityScope::Entities(entities) => {
                let mut seen: Vec<&str> = Vec::with_capacity(entities.len());
                let mut present = 0;
                for entity in entities {
                    if seen.contains(&entity.as_str()) {
                        continue;
                    }
                    seen.push(entity);
                    if self.store.exists(date, entity)? {
                        present += 1;
                    }
                }
                Ok(present)
            }
        }
    }

    /// Whether `date` holds strictly fewer than `min_rows_threshold` records.
    pub fn is_gap(
        &self,
        scope: &EntityScope,
        date: NaiveDate,
        min_rows_threshold: u64,
    ) -> Result<bool, StoreError> {
        Ok(self.population(scope, date)? < min_rows_threshold)
    }

    /// Dates in `as_of, as_of - 1, ..., as_of - (lookback_days - 1)` whose
    /// population is below the threshold, most recent first.
    ///
    /// Non-trading days with zero rows are reported too; callers that care
    /// filter them with a `TradingCalendar`.
    pub fn find_gaps(
        &self,
        scope: &EntityScope,
        lookback_days: u32,
        min_rows_threshold: u64,
        as_of: NaiveDate,
    ) -> Result<Vec<NaiveDate>, StoreError> {
        let mut gaps = Vec::new();
        for offset in 0..i64::from(lookback_days) {
            let Some(date) = as_of.checked_sub_signed(Duration::days(offset)) else {
                break;
            };
            if self.is_gap(scope, date, min_rows_threshold)? {
                gaps.push(date);
            }
        }
        Ok(gaps)
    }
}
