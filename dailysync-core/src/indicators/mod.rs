//! Rolling indicators computed from stored records.
//!
//! - `sma`: fixed-window mean and deviation ratio primitives
//! - `calculator`: per-entity computation that writes `sma_{w}` / `dev_{w}`
//! - `breadth`: share of entities trading above their moving average

pub mod breadth;
pub mod calculator;
pub mod sma;

use thiserror::Error;

use crate::store::StoreError;

pub use breadth::{breadth_on, BreadthPoint, BreadthSummary};
pub use calculator::{
    BatchOutcome, IndicatorCalculator, IndicatorOutcome, SkipReason, WindowSkip,
};
pub use sma::{deviation_ratio, Sma};

#[derive(Debug, Error)]
pub enum IndicatorError {
    #[error("window length must be >= 1")]
    ZeroWindow,

    #[error("no indicator windows configured")]
    NoWindows,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Seed `closes` for `entity` on consecutive days starting at 2024-01-01.
#[cfg(test)]
pub fn seed_closes(
    store: &dyn crate::store::TimeSeriesStore,
    entity: &str,
    closes: &[f64],
) -> Vec<chrono::NaiveDate> {
    use crate::domain::DatedRecord;
    use crate::store::WriteMode;

    let base = chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let date = base + chrono::Duration::days(i as i64);
            let record = DatedRecord::new(date, entity).with_field("close", close);
            store.upsert(&record, WriteMode::InsertOnly).unwrap();
            date
        })
        .collect()
}

/// Assert two f64 values are approximately equal (within epsilon).
#[cfg(test)]
pub fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
    assert!(
        (actual - expected).abs() < epsilon,
        "assert_approx failed: actual={actual}, expected={expected}, diff={}, epsilon={epsilon}",
        (actual - expected).abs()
    );
}

#[cfg(test)]
pub const DEFAULT_EPSILON: f64 = 1e-10;
