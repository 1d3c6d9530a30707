//! Data source trait and structured error types.
//!
//! `DataSourceAdapter` abstracts over upstream feeds (CSV drops, a relational
//! database, an HTTP API) so the sync engine can swap implementations and
//! mock them in tests.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use thiserror::Error;

use crate::domain::FieldValue;

/// One upstream row, keyed by the source's own column names.
pub type SourceRow = BTreeMap<String, FieldValue>;

/// Failures raised by an adapter. Every variant is retried by the sync
/// engine up to its attempt bound.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transient source failure: {0}")]
    Transient(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("malformed source data: {0}")]
    Malformed(String),

    #[error("source i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("source database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Trait for upstream data sources.
///
/// `fetch` returns every row the source has for one date. An empty vector
/// means the source has no data for that date (a holiday, or not published
/// yet); it is not an error.
pub trait DataSourceAdapter: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    fn fetch(&self, date: NaiveDate) -> Result<Vec<SourceRow>, SourceError>;
}
