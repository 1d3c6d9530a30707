//! Persisted time-series store.
//!
//! The `TimeSeriesStore` trait is the only way records enter or leave
//! persistence. `SqliteStore` is the production implementation; tests use
//! `SqliteStore::in_memory()`.

pub mod schema;
pub mod sqlite;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DatedRecord, IndicatorRecord};

pub use sqlite::SqliteStore;

/// How a write treats an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Existing keys are left untouched; the write is a no-op.
    InsertOnly,
    /// Existing keys have their payload overwritten; the key is preserved.
    Replace,
}

/// Storage-layer failures. Always fatal to the operation in progress.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("duplicate key in batch: ({date}, {entity})")]
    DuplicateKey { date: NaiveDate, entity: String },

    #[error("non-finite indicator value for ({date}, {entity}, {indicator})")]
    NonFiniteValue {
        date: NaiveDate,
        entity: String,
        indicator: String,
    },

    #[error("non-finite payload field for ({date}, {entity}): {field}")]
    NonFinitePayload {
        date: NaiveDate,
        entity: String,
        field: String,
    },

    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Keyed, persisted table of dated records and derived indicators.
pub trait TimeSeriesStore: Send + Sync {
    /// Whether a record exists for `(date, entity)`.
    fn exists(&self, date: NaiveDate, entity: &str) -> Result<bool, StoreError>;

    /// Number of records on `date` across all entities.
    fn count(&self, date: NaiveDate) -> Result<u64, StoreError>;

    fn get(&self, date: NaiveDate, entity: &str) -> Result<Option<DatedRecord>, StoreError>;

    /// Write one record. Returns whether a row was actually inserted or changed.
    fn upsert(&self, record: &DatedRecord, mode: WriteMode) -> Result<bool, StoreError>;

    /// Write a batch in a single transaction. Returns the number of rows
    /// actually inserted or changed. A batch containing the same key twice is
    /// rejected as a whole with [`StoreError::DuplicateKey`].
    fn upsert_batch(&self, records: &[DatedRecord], mode: WriteMode) -> Result<u64, StoreError>;

    /// Records for `entity` with `from <= date <= to`, ascending by date.
    fn query_range(
        &self,
        entity: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DatedRecord>, StoreError>;

    /// The most recent `limit` records for `entity` with `date <= as_of`,
    /// returned ascending by date.
    fn query_latest(
        &self,
        entity: &str,
        as_of: NaiveDate,
        limit: usize,
    ) -> Result<Vec<DatedRecord>, StoreError>;

    /// Entities with a record on `date`, sorted.
    fn entities_on(&self, date: NaiveDate) -> Result<Vec<String>, StoreError>;

    /// Entities with at least one record in `from..=to`, sorted.
    fn entities_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<String>, StoreError>;

    fn upsert_indicator(&self, record: &IndicatorRecord, mode: WriteMode)
        -> Result<bool, StoreError>;

    /// Remove one indicator value. Returns whether a row existed.
    fn delete_indicator(
        &self,
        date: NaiveDate,
        entity: &str,
        indicator: &str,
    ) -> Result<bool, StoreError>;

    fn indicator(
        &self,
        date: NaiveDate,
        entity: &str,
        indicator: &str,
    ) -> Result<Option<f64>, StoreError>;

    /// All values of `indicator` on `date`, sorted by entity.
    fn indicators_on(
        &self,
        date: NaiveDate,
        indicator: &str,
    ) -> Result<Vec<IndicatorRecord>, StoreError>;

    /// Latest date strictly before `before` that has any `indicator` value.
    fn previous_indicator_date(
        &self,
        indicator: &str,
        before: NaiveDate,
    ) -> Result<Option<NaiveDate>, StoreError>;
}
