//! dailysync core: persisted time-series store, gap detection, incremental
//! sync and rolling indicators.
//!
//! This crate contains everything below the pipeline layer:
//! - Domain types (dated records, field values, indicator records)
//! - SQLite-backed `TimeSeriesStore` with explicit write modes
//! - Upstream source adapters and field mapping
//! - Gap detection and the retrying `SyncEngine`
//! - Fixed-window moving averages, deviation ratios and market breadth

pub mod data;
pub mod domain;
pub mod indicators;
pub mod store;
pub mod sync;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything the runner moves onto step worker
    /// threads is Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<domain::DatedRecord>();
        require_sync::<domain::DatedRecord>();
        require_send::<domain::IndicatorRecord>();
        require_sync::<domain::IndicatorRecord>();

        require_send::<store::SqliteStore>();
        require_sync::<store::SqliteStore>();
        require_send::<store::StoreError>();

        require_send::<data::CsvDirAdapter>();
        require_sync::<data::CsvDirAdapter>();
        require_send::<data::SqliteSourceAdapter>();
        require_sync::<data::SqliteSourceAdapter>();
        require_send::<data::FieldMapping>();
        require_sync::<data::FieldMapping>();
        require_send::<data::HolidayCalendar>();
        require_sync::<data::HolidayCalendar>();

        require_send::<sync::SyncOutcome>();
        require_send::<sync::SyncError>();
    }
}
