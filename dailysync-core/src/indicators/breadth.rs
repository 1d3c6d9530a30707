//! Market breadth: how many entities close above their moving average.
//!
//! The denominator is the set of entities that have `sma_{w}` on the date
//! and a numeric close; entities without a satisfied window are left out
//! rather than counted as "below".

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::store::{StoreError, TimeSeriesStore};

/// Breadth on a single date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreadthPoint {
    pub date: NaiveDate,
    pub above: usize,
    pub total: usize,
    pub ratio_pct: f64,
}

/// Breadth on a date, with the previous breadth date for comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreadthSummary {
    pub window: usize,
    pub current: BreadthPoint,
    pub previous: Option<BreadthPoint>,
}

impl BreadthSummary {
    /// Change in percentage points versus the previous breadth date.
    pub fn change_pct(&self) -> Option<f64> {
        self.previous
            .map(|prev| self.current.ratio_pct - prev.ratio_pct)
    }
}

impl fmt::Display for BreadthSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} above sma_{}: {}/{} ({:.2}%)",
            self.current.date,
            self.window,
            self.current.above,
            self.current.total,
            self.current.ratio_pct
        )?;
        if let (Some(prev), Some(change)) = (self.previous, self.change_pct()) {
            write!(f, ", {change:+.2} pts vs {}", prev.date)?;
        }
        Ok(())
    }
}

fn point(
    store: &dyn TimeSeriesStore,
    date: NaiveDate,
    window: usize,
    field: &str,
) -> Result<Option<BreadthPoint>, StoreError> {
    let indicator = format!("sma_{window}");
    let mut above = 0;
    let mut total = 0;
    for sma in store.indicators_on(date, &indicator)? {
        let close = store
            .get(date, &sma.entity)?
            .and_then(|record| record.number(field));
        if let Some(close) = close {
            total += 1;
            if close > sma.value {
                above += 1;
            }
        }
    }
    if total == 0 {
        return Ok(None);
    }
    Ok(Some(BreadthPoint {
        date,
        above,
        total,
        ratio_pct: above as f64 / total as f64 * 100.0,
    }))
}

/// Breadth for `sma_{window}` on `date`, or `None` when no entity has a
/// satisfied window that day.
pub fn breadth_on(
    store: &dyn TimeSeriesStore,
    date: NaiveDate,
    window: usize,
    field: &str,
) -> Result<Option<BreadthSummary>, StoreError> {
    let Some(current) = point(store, date, window, field)? else {
        return Ok(None);
    };
    let previous = match store.previous_indicator_date(&format!("sma_{window}"), date)? {
        Some(prev) => point(store, prev, window, field)?,
        None => None,
    };
    Ok(Some(BreadthSummary {
        window,
        current,
        previous,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DatedRecord, IndicatorRecord};
    use crate::indicators::{assert_approx, DEFAULT_EPSILON};
    use crate::store::{SqliteStore, WriteMode};

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn put(store: &SqliteStore, date: &str, entity: &str, close: f64, sma: Option<f64>) {
        store
            .upsert(
                &DatedRecord::new(d(date), entity).with_field("close", close),
                WriteMode::InsertOnly,
            )
            .unwrap();
        if let Some(sma) = sma {
            store
                .upsert_indicator(
                    &IndicatorRecord::new(d(date), entity, "sma_50", sma),
                    WriteMode::Replace,
                )
                .unwrap();
        }
    }

    #[test]
    fn counts_entities_above_average() {
        let store = SqliteStore::in_memory().unwrap();
        put(&store, "2024-03-08", "A", 11.0, Some(10.0));
        put(&store, "2024-03-08", "B", 9.0, Some(10.0));
        put(&store, "2024-03-08", "C", 12.0, Some(10.0));
        put(&store, "2024-03-08", "D", 20.0, None); // no satisfied window

        let summary = breadth_on(&store, d("2024-03-08"), 50, "close").unwrap().unwrap();
        assert_eq!(summary.current.above, 2);
        assert_eq!(summary.current.total, 3);
        assert_approx(summary.current.ratio_pct, 200.0 / 3.0, DEFAULT_EPSILON);
        assert!(summary.previous.is_none());
        assert_eq!(summary.change_pct(), None);
    }

    #[test]
    fn compares_with_previous_breadth_date() {
        let store = SqliteStore::in_memory().unwrap();
        put(&store, "2024-03-07", "A", 9.0, Some(10.0));
        put(&store, "2024-03-07", "B", 11.0, Some(10.0));
        put(&store, "2024-03-08", "A", 11.0, Some(10.0));
        put(&store, "2024-03-08", "B", 11.0, Some(10.0));

        let summary = breadth_on(&store, d("2024-03-08"), 50, "close").unwrap().unwrap();
        assert_eq!(summary.previous.unwrap().date, d("2024-03-07"));
        assert_approx(summary.change_pct().unwrap(), 50.0, DEFAULT_EPSILON);
        assert_eq!(
            summary.to_string(),
            "2024-03-08 above sma_50: 2/2 (100.00%), +50.00 pts vs 2024-03-07"
        );
    }

    #[test]
    fn no_satisfied_windows_means_no_breadth() {
        let store = SqliteStore::in_memory().unwrap();
        put(&store, "2024-03-08", "A", 11.0, None);
        assert!(breadth_on(&store, d("2024-03-08"), 50, "close").unwrap().is_none());
    }
}
