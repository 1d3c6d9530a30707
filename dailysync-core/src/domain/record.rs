//! Dated records: one row per `(date, entity)` with a free-form payload.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A single payload value. Upstream sources deliver either numbers or text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Finite numeric view of the value. Text that parses as a number counts.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n).filter(|n| n.is_finite()),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        }
    }

    /// Parse a raw cell: numbers become `Number`, everything else `Text`.
    ///
    /// Zero-padded integers such as `000001` are identifiers, not numbers,
    /// and stay `Text` so the padding survives.
    pub fn parse_cell(raw: &str) -> Self {
        let trimmed = raw.trim();
        if is_zero_padded(trimmed) {
            return FieldValue::Text(trimmed.to_string());
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => FieldValue::Number(n),
            _ => FieldValue::Text(trimmed.to_string()),
        }
    }
}

fn is_zero_padded(s: &str) -> bool {
    s.len() > 1 && s.starts_with('0') && s.bytes().all(|b| b.is_ascii_digit())
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

/// Named payload fields, ordered so the serialized form is stable.
pub type Payload = BTreeMap<String, FieldValue>;

/// One stored observation for an entity on a date.
///
/// The key is `(date, entity)`; the store holds at most one record per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatedRecord {
    pub date: NaiveDate,
    pub entity: String,
    pub payload: Payload,
}

impl DatedRecord {
    pub fn new(date: NaiveDate, entity: impl Into<String>) -> Self {
        Self {
            date,
            entity: entity.into(),
            payload: Payload::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    /// Numeric value of `field`, if present and numeric.
    pub fn number(&self, field: &str) -> Option<f64> {
        self.payload.get(field).and_then(FieldValue::as_f64)
    }

    pub fn key(&self) -> (NaiveDate, &str) {
        (self.date, &self.entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn parse_cell_distinguishes_numbers_and_text() {
        assert_eq!(FieldValue::parse_cell(" 12.5 "), FieldValue::Number(12.5));
        assert_eq!(
            FieldValue::parse_cell("Ping An"),
            FieldValue::Text("Ping An".into())
        );
        assert_eq!(FieldValue::parse_cell("NaN"), FieldValue::Text("NaN".into()));
        assert_eq!(FieldValue::parse_cell("000001"), FieldValue::Text("000001".into()));
        assert_eq!(FieldValue::parse_cell("0.5"), FieldValue::Number(0.5));
        assert_eq!(FieldValue::parse_cell("0"), FieldValue::Number(0.0));
    }

    #[test]
    fn numeric_text_is_readable_as_number() {
        let rec = DatedRecord::new(d("2024-03-01"), "600000")
            .with_field("close", "10.25")
            .with_field("name", "bank");
        assert_eq!(rec.number("close"), Some(10.25));
        assert_eq!(rec.number("name"), None);
        assert_eq!(rec.number("missing"), None);
    }

    #[test]
    fn payload_serializes_untagged() {
        let rec = DatedRecord::new(d("2024-03-01"), "600000")
            .with_field("close", 10.0)
            .with_field("name", "bank");
        let json = serde_json::to_string(&rec.payload).unwrap();
        assert_eq!(json, r#"{"close":10.0,"name":"bank"}"#);
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec.payload);
    }
}
