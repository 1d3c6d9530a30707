//! Derived indicator values keyed by `(date, entity, indicator)`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A computed indicator value. Only ever written when its window was
/// fully satisfied, so the value is always finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub date: NaiveDate,
    pub entity: String,
    pub indicator: String,
    pub value: f64,
}

impl IndicatorRecord {
    pub fn new(
        date: NaiveDate,
        entity: impl Into<String>,
        indicator: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            date,
            entity: entity.into(),
            indicator: indicator.into(),
            value,
        }
    }
}
