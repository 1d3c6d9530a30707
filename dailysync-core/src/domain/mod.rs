//! Domain types shared by the store, the sync engine and the indicators.

pub mod indicator;
pub mod record;

pub use indicator::IndicatorRecord;
pub use record::{DatedRecord, FieldValue, Payload};
