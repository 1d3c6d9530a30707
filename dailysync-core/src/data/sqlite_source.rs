//! Relational source: rows for a date read from another SQLite database.
//!
//! The query is configured as a complete statement with a single `?1`
//! placeholder bound to the date, e.g.
//! `SELECT * FROM stock_history WHERE trade_date = ?1`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags};

use super::provider::{DataSourceAdapter, SourceError, SourceRow};
use crate::domain::FieldValue;

pub const DEFAULT_SOURCE_QUERY: &str = "SELECT * FROM stock_history WHERE trade_date = ?1";

pub struct SqliteSourceAdapter {
    path: PathBuf,
    query: String,
    conn: Mutex<Connection>,
    name: String,
}

impl SqliteSourceAdapter {
    /// Open the source database read-only.
    pub fn open(path: &Path, query: Option<&str>) -> Result<Self, SourceError> {
        let query = query.unwrap_or(DEFAULT_SOURCE_QUERY).trim().to_string();
        validate_query(&query)?;
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        // Surface syntax errors and unknown tables at open, not per date.
        conn.prepare(&query)?;
        Ok(Self {
            name: format!("sqlite:{}", path.display()),
            path: path.to_path_buf(),
            query,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, SourceError> {
        self.conn
            .lock()
            .map_err(|_| SourceError::Unavailable("source connection lock poisoned".into()))
    }
}

fn validate_query(query: &str) -> Result<(), SourceError> {
    let lowered = query.to_ascii_lowercase();
    if !(lowered.starts_with("select") || lowered.starts_with("with")) {
        return Err(SourceError::Malformed(format!(
            "source query must be a SELECT statement: {query}"
        )));
    }
    if !query.contains("?1") {
        return Err(SourceError::Malformed(format!(
            "source query must bind the date as ?1: {query}"
        )));
    }
    Ok(())
}

fn cell(value: ValueRef<'_>) -> Option<FieldValue> {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => None,
        // Integers past 2^53 would round as f64; keep their digits instead.
        ValueRef::Integer(i) if i.unsigned_abs() > 1 << 53 => Some(FieldValue::Text(i.to_string())),
        ValueRef::Integer(i) => Some(FieldValue::Number(i as f64)),
        ValueRef::Real(r) if r.is_finite() => Some(FieldValue::Number(r)),
        ValueRef::Real(r) => Some(FieldValue::Text(r.to_string())),
        ValueRef::Text(bytes) => Some(FieldValue::Text(String::from_utf8_lossy(bytes).into_owned())),
    }
}

impl DataSourceAdapter for SqliteSourceAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, date: NaiveDate) -> Result<Vec<SourceRow>, SourceError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare_cached(&self.query)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params![date.format("%Y-%m-%d").to_string()])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut source_row = SourceRow::new();
            for (i, column) in columns.iter().enumerate() {
                if let Some(value) = cell(row.get_ref(i)?) {
                    source_row.insert(column.clone(), value);
                }
            }
            out.push(source_row);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn seed(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE stock_history (trade_date TEXT, stock_code TEXT, close_price REAL, volume INTEGER, note TEXT);
             INSERT INTO stock_history VALUES ('2024-03-01', '600000', 10.5, 1200, NULL);
             INSERT INTO stock_history VALUES ('2024-03-01', '000001', 8.25, 900, 'st');
             INSERT INTO stock_history VALUES ('2024-03-04', '600000', 10.7, 1500, NULL);",
        )
        .unwrap();
    }

    #[test]
    fn fetches_rows_for_date_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        seed(&path);

        let adapter = SqliteSourceAdapter::open(&path, None).unwrap();
        let rows = adapter.fetch(d("2024-03-01")).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r["trade_date"] == FieldValue::Text("2024-03-01".into())));
        let first = rows.iter().find(|r| r["stock_code"] == FieldValue::Text("600000".into())).unwrap();
        assert_eq!(first["volume"], FieldValue::Number(1200.0));
        assert!(!first.contains_key("note"));

        assert!(adapter.fetch(d("2024-03-02")).unwrap().is_empty());
    }

    #[test]
    fn non_finite_reals_arrive_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        seed(&path);
        Connection::open(&path)
            .unwrap()
            .execute_batch("INSERT INTO stock_history VALUES ('2024-03-05', '600000', 1e999, 10, NULL);")
            .unwrap();

        let adapter = SqliteSourceAdapter::open(&path, None).unwrap();
        let rows = adapter.fetch(d("2024-03-05")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["close_price"], FieldValue::Text("inf".into()));
        assert_eq!(rows[0]["close_price"].as_f64(), None);
    }

    #[test]
    fn wide_integers_keep_their_digits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        seed(&path);
        Connection::open(&path)
            .unwrap()
            .execute_batch("INSERT INTO stock_history VALUES ('2024-03-06', '600000', 1.0, 9007199254740993, NULL);")
            .unwrap();

        let adapter = SqliteSourceAdapter::open(&path, None).unwrap();
        let rows = adapter.fetch(d("2024-03-06")).unwrap();
        assert_eq!(rows[0]["volume"], FieldValue::Text("9007199254740993".into()));
    }

    #[test]
    fn rejects_queries_without_date_binding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        seed(&path);

        let err = SqliteSourceAdapter::open(&path, Some("SELECT * FROM stock_history"))
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::Malformed(_)));
        let err = SqliteSourceAdapter::open(&path, Some("DELETE FROM stock_history WHERE trade_date = ?1"))
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn unknown_table_fails_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        seed(&path);
        let err = SqliteSourceAdapter::open(&path, Some("SELECT * FROM nope WHERE d = ?1"))
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::Database(_)));
    }
}
