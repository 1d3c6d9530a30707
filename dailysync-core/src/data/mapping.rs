//! Source-to-payload field mapping.
//!
//! Upstream sources name their columns however they like; the store sees
//! one stable vocabulary. The mapping also pulls out the entity identifier
//! and drops the source's own date column, since the date is the fetch key.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::provider::SourceRow;
use crate::domain::{DatedRecord, FieldValue, Payload};

#[derive(Debug, Error, PartialEq)]
pub enum MappingError {
    #[error("row has no entity column '{0}'")]
    MissingEntity(String),

    #[error("row has an empty entity identifier")]
    EmptyEntity,

    #[error("numeric entity identifier {0} cannot be represented exactly")]
    InexactEntity(f64),
}

/// Largest integer an `f64` holds without rounding (2^53).
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// How source columns become payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Source column holding the entity identifier.
    #[serde(default = "default_entity_field")]
    pub entity_field: String,
    /// Source column holding the row date, dropped from the payload.
    #[serde(default)]
    pub date_field: Option<String>,
    /// `source column -> payload field` renames.
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
    /// Keep source columns that have no rename entry under their own name.
    #[serde(default = "default_keep_unmapped")]
    pub keep_unmapped: bool,
}

fn default_entity_field() -> String {
    "entity".to_string()
}

fn default_keep_unmapped() -> bool {
    true
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            entity_field: default_entity_field(),
            date_field: None,
            renames: BTreeMap::new(),
            keep_unmapped: true,
        }
    }
}

impl FieldMapping {
    pub fn new(entity_field: impl Into<String>) -> Self {
        Self {
            entity_field: entity_field.into(),
            ..Self::default()
        }
    }

    pub fn with_date_field(mut self, field: impl Into<String>) -> Self {
        self.date_field = Some(field.into());
        self
    }

    pub fn rename(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.renames.insert(source.into(), target.into());
        self
    }

    /// Map one source row into a record for `date`.
    pub fn map_row(&self, date: NaiveDate, row: &SourceRow) -> Result<DatedRecord, MappingError> {
        let entity = match row.get(&self.entity_field) {
            Some(value) => entity_id(value)?,
            None => return Err(MappingError::MissingEntity(self.entity_field.clone())),
        };
        if entity.is_empty() {
            return Err(MappingError::EmptyEntity);
        }

        let mut payload = Payload::new();
        for (column, value) in row {
            if *column == self.entity_field || self.date_field.as_deref() == Some(column.as_str()) {
                continue;
            }
            match self.renames.get(column) {
                Some(target) => {
                    payload.insert(target.clone(), value.clone());
                }
                None if self.keep_unmapped => {
                    payload.insert(column.clone(), value.clone());
                }
                None => {}
            }
        }

        Ok(DatedRecord {
            date,
            entity,
            payload,
        })
    }
}

/// Integral numeric identifiers print without a fractional part. Numbers
/// past 2^53 may already have been rounded, so they are refused.
fn entity_id(value: &FieldValue) -> Result<String, MappingError> {
    match value {
        FieldValue::Text(s) => Ok(s.trim().to_string()),
        FieldValue::Number(n) if !n.is_finite() || n.abs() > MAX_EXACT_INTEGER => {
            Err(MappingError::InexactEntity(*n))
        }
        FieldValue::Number(n) if n.fract() == 0.0 => Ok(format!("{}", *n as i64)),
        FieldValue::Number(n) => Ok(n.to_string()),
    }
}
