//! SQLite-backed implementation of [`TimeSeriesStore`].
//!
//! Uses a single `Mutex<Connection>` so the store can be shared behind an
//! `Arc` across step worker threads. Key-level idempotency (`ON CONFLICT`)
//! is what keeps concurrent or repeated writers safe, not isolation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::schema::apply_migrations;
use super::{StoreError, TimeSeriesStore, WriteMode};
use crate::domain::{DatedRecord, FieldValue, IndicatorRecord, Payload};

const INSERT_RECORD: &str = r"
INSERT INTO dated_records (date, entity, payload_json) VALUES (?1, ?2, ?3)
ON CONFLICT (date, entity) DO NOTHING
";

const REPLACE_RECORD: &str = r"
INSERT INTO dated_records (date, entity, payload_json) VALUES (?1, ?2, ?3)
ON CONFLICT (date, entity) DO UPDATE SET
    payload_json = excluded.payload_json,
    updated_at = datetime('now')
WHERE dated_records.payload_json IS NOT excluded.payload_json
";

const INSERT_INDICATOR: &str = r"
INSERT INTO indicator_records (date, entity, indicator, value) VALUES (?1, ?2, ?3, ?4)
ON CONFLICT (date, entity, indicator) DO NOTHING
";

const REPLACE_INDICATOR: &str = r"
INSERT INTO indicator_records (date, entity, indicator, value) VALUES (?1, ?2, ?3, ?4)
ON CONFLICT (date, entity, indicator) DO UPDATE SET
    value = excluded.value,
    updated_at = datetime('now')
WHERE indicator_records.value IS NOT excluded.value
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn record_sql(mode: WriteMode) -> &'static str {
    match mode {
        WriteMode::InsertOnly => INSERT_RECORD,
        WriteMode::Replace => REPLACE_RECORD,
    }
}

fn indicator_sql(mode: WriteMode) -> &'static str {
    match mode {
        WriteMode::InsertOnly => INSERT_INDICATOR,
        WriteMode::Replace => REPLACE_INDICATOR,
    }
}

/// SQLite time-series store.
///
/// Create with [`SqliteStore::open`] for file-backed persistence or
/// [`SqliteStore::in_memory`] for tests.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at `path`, creating parent directories and
    /// applying pending migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let applied = apply_migrations(&conn)?;
        debug!(path = %path.display(), applied, "opened store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

type RawRecord = (NaiveDate, String, String);

fn decode(raw: Vec<RawRecord>) -> Result<Vec<DatedRecord>, StoreError> {
    raw.into_iter()
        .map(|(date, entity, json)| {
            let payload: Payload = serde_json::from_str(&json)?;
            Ok(DatedRecord {
                date,
                entity,
                payload,
            })
        })
        .collect()
}

fn check_finite(record: &IndicatorRecord) -> Result<(), StoreError> {
    if record.value.is_finite() {
        Ok(())
    } else {
        Err(StoreError::NonFiniteValue {
            date: record.date,
            entity: record.entity.clone(),
            indicator: record.indicator.clone(),
        })
    }
}

/// Non-finite numbers serialize as `null` and could never be read back.
fn check_payload(record: &DatedRecord) -> Result<(), StoreError> {
    let bad = record
        .payload
        .iter()
        .find(|(_, value)| matches!(value, FieldValue::Number(n) if !n.is_finite()));
    match bad {
        Some((field, _)) => Err(StoreError::NonFinitePayload {
            date: record.date,
            entity: record.entity.clone(),
            field: field.clone(),
        }),
        None => Ok(()),
    }
}

impl TimeSeriesStore for SqliteStore {
    fn exists(&self, date: NaiveDate, entity: &str) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM dated_records WHERE date = ?1 AND entity = ?2",
                params![date, entity],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn count(&self, date: NaiveDate) -> Result<u64, StoreError> {
        let conn = self.lock_conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dated_records WHERE date = ?1",
            params![date],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn get(&self, date: NaiveDate, entity: &str) -> Result<Option<DatedRecord>, StoreError> {
        let conn = self.lock_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM dated_records WHERE date = ?1 AND entity = ?2",
                params![date, entity],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        match json {
            Some(json) => Ok(decode(vec![(date, entity.to_string(), json)])?.pop()),
            None => Ok(None),
        }
    }

    fn upsert(&self, record: &DatedRecord, mode: WriteMode) -> Result<bool, StoreError> {
        check_payload(record)?;
        let json = serde_json::to_string(&record.payload)?;
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            record_sql(mode),
            params![record.date, record.entity, json],
        )?;
        Ok(changed > 0)
    }

    fn upsert_batch(&self, records: &[DatedRecord], mode: WriteMode) -> Result<u64, StoreError> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            check_payload(record)?;
            if !seen.insert(record.key()) {
                return Err(StoreError::DuplicateKey {
                    date: record.date,
                    entity: record.entity.clone(),
                });
            }
        }
        let encoded = records
            .iter()
            .map(|r| serde_json::to_string(&r.payload))
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut written = 0u64;
        {
            let mut stmt = tx.prepare_cached(record_sql(mode))?;
            for (record, json) in records.iter().zip(&encoded) {
                written += stmt.execute(params![record.date, record.entity, json])? as u64;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    fn query_range(
        &self,
        entity: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DatedRecord>, StoreError> {
        let raw = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare_cached(
                "SELECT date, entity, payload_json FROM dated_records \
                 WHERE entity = ?1 AND date >= ?2 AND date <= ?3 ORDER BY date ASC",
            )?;
            let rows = stmt.query_map(params![entity, from, to], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let raw = rows.collect::<Result<Vec<RawRecord>, _>>()?;
            raw
        };
        decode(raw)
    }

    fn query_latest(
        &self,
        entity: &str,
        as_of: NaiveDate,
        limit: usize,
    ) -> Result<Vec<DatedRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut raw = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare_cached(
                "SELECT date, entity, payload_json FROM dated_records \
                 WHERE entity = ?1 AND date <= ?2 ORDER BY date DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![entity, as_of, limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let raw = rows.collect::<Result<Vec<RawRecord>, _>>()?;
            raw
        };
        raw.reverse();
        decode(raw)
    }

    fn entities_on(&self, date: NaiveDate) -> Result<Vec<String>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT entity FROM dated_records WHERE date = ?1 ORDER BY entity ASC",
        )?;
        let rows = stmt.query_map(params![date], |row| row.get(0))?;
        let entities = rows.collect::<Result<Vec<String>, _>>()?;
        Ok(entities)
    }

    fn entities_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<String>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT entity FROM dated_records \
             WHERE date >= ?1 AND date <= ?2 ORDER BY entity ASC",
        )?;
        let rows = stmt.query_map(params![from, to], |row| row.get(0))?;
        let entities = rows.collect::<Result<Vec<String>, _>>()?;
        Ok(entities)
    }

    fn upsert_indicator(
        &self,
        record: &IndicatorRecord,
        mode: WriteMode,
    ) -> Result<bool, StoreError> {
        check_finite(record)?;
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            indicator_sql(mode),
            params![record.date, record.entity, record.indicator, record.value],
        )?;
        Ok(changed > 0)
    }

    fn delete_indicator(
        &self,
        date: NaiveDate,
        entity: &str,
        indicator: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM indicator_records WHERE date = ?1 AND entity = ?2 AND indicator = ?3",
            params![date, entity, indicator],
        )?;
        Ok(removed > 0)
    }

    fn indicator(
        &self,
        date: NaiveDate,
        entity: &str,
        indicator: &str,
    ) -> Result<Option<f64>, StoreError> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM indicator_records \
                 WHERE date = ?1 AND entity = ?2 AND indicator = ?3",
                params![date, entity, indicator],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn indicators_on(
        &self,
        date: NaiveDate,
        indicator: &str,
    ) -> Result<Vec<IndicatorRecord>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT date, entity, indicator, value FROM indicator_records \
             WHERE date = ?1 AND indicator = ?2 ORDER BY entity ASC",
        )?;
        let rows = stmt.query_map(params![date, indicator], |row| {
            Ok(IndicatorRecord {
                date: row.get(0)?,
                entity: row.get(1)?,
                indicator: row.get(2)?,
                value: row.get(3)?,
            })
        })?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn previous_indicator_date(
        &self,
        indicator: &str,
        before: NaiveDate,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let conn = self.lock_conn()?;
        let date = conn
            .query_row(
                "SELECT MAX(date) FROM indicator_records WHERE indicator = ?1 AND date < ?2",
                params![indicator, before],
                |row| row.get::<_, Option<NaiveDate>>(0),
            )?;
        Ok(date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn rec(date: &str, entity: &str, close: f64) -> DatedRecord {
        DatedRecord::new(d(date), entity).with_field("close", close)
    }

    #[test]
    fn insert_only_ignores_existing_key() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.upsert(&rec("2024-03-01", "A", 10.0), WriteMode::InsertOnly).unwrap());
        assert!(!store.upsert(&rec("2024-03-01", "A", 99.0), WriteMode::InsertOnly).unwrap());

        let stored = store.get(d("2024-03-01"), "A").unwrap().unwrap();
        assert_eq!(stored.number("close"), Some(10.0));
        assert_eq!(store.count(d("2024-03-01")).unwrap(), 1);
    }

    #[test]
    fn replace_overwrites_payload_and_reports_no_op_for_identical() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert(&rec("2024-03-01", "A", 10.0), WriteMode::InsertOnly).unwrap();

        assert!(store.upsert(&rec("2024-03-01", "A", 11.0), WriteMode::Replace).unwrap());
        assert!(!store.upsert(&rec("2024-03-01", "A", 11.0), WriteMode::Replace).unwrap());

        let stored = store.get(d("2024-03-01"), "A").unwrap().unwrap();
        assert_eq!(stored.number("close"), Some(11.0));
        assert_eq!(store.count(d("2024-03-01")).unwrap(), 1);
    }

    #[test]
    fn batch_counts_only_new_rows() {
        let store = SqliteStore::in_memory().unwrap();
        let batch = vec![rec("2024-03-01", "A", 1.0), rec("2024-03-01", "B", 2.0)];
        assert_eq!(store.upsert_batch(&batch, WriteMode::InsertOnly).unwrap(), 2);
        assert_eq!(store.upsert_batch(&batch, WriteMode::InsertOnly).unwrap(), 0);

        let mixed = vec![rec("2024-03-01", "B", 2.0), rec("2024-03-01", "C", 3.0)];
        assert_eq!(store.upsert_batch(&mixed, WriteMode::InsertOnly).unwrap(), 1);
        assert_eq!(store.count(d("2024-03-01")).unwrap(), 3);
    }

    #[test]
    fn duplicate_key_in_batch_rejects_whole_batch() {
        let store = SqliteStore::in_memory().unwrap();
        let batch = vec![
            rec("2024-03-01", "A", 1.0),
            rec("2024-03-01", "B", 2.0),
            rec("2024-03-01", "A", 3.0),
        ];
        let err = store.upsert_batch(&batch, WriteMode::InsertOnly).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { ref entity, .. } if entity == "A"));
        assert_eq!(store.count(d("2024-03-01")).unwrap(), 0);
    }

    #[test]
    fn exists_and_entities_on() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_batch(
                &[rec("2024-03-01", "B", 1.0), rec("2024-03-01", "A", 2.0)],
                WriteMode::InsertOnly,
            )
            .unwrap();
        assert!(store.exists(d("2024-03-01"), "A").unwrap());
        assert!(!store.exists(d("2024-03-02"), "A").unwrap());
        assert_eq!(store.entities_on(d("2024-03-01")).unwrap(), vec!["A", "B"]);
        assert!(store.entities_on(d("2024-03-02")).unwrap().is_empty());
    }

    #[test]
    fn entities_between_spans_the_range() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert(&rec("2024-03-01", "C", 1.0), WriteMode::InsertOnly).unwrap();
        store.upsert(&rec("2024-03-03", "A", 1.0), WriteMode::InsertOnly).unwrap();
        store.upsert(&rec("2024-03-03", "C", 1.0), WriteMode::InsertOnly).unwrap();
        store.upsert(&rec("2024-03-09", "B", 1.0), WriteMode::InsertOnly).unwrap();

        assert_eq!(
            store.entities_between(d("2024-03-01"), d("2024-03-05")).unwrap(),
            vec!["A", "C"]
        );
        assert!(store.entities_between(d("2024-03-04"), d("2024-03-08")).unwrap().is_empty());
    }

    #[test]
    fn query_range_is_ascending_and_inclusive() {
        let store = SqliteStore::in_memory().unwrap();
        for (date, close) in [("2024-03-04", 4.0), ("2024-03-01", 1.0), ("2024-03-02", 2.0)] {
            store.upsert(&rec(date, "A", close), WriteMode::InsertOnly).unwrap();
        }
        store.upsert(&rec("2024-03-02", "B", 9.0), WriteMode::InsertOnly).unwrap();

        let rows = store.query_range("A", d("2024-03-01"), d("2024-03-02")).unwrap();
        let dates: Vec<_> = rows.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![d("2024-03-01"), d("2024-03-02")]);
        assert!(rows.iter().all(|r| r.entity == "A"));
    }

    #[test]
    fn query_latest_returns_most_recent_ascending() {
        let store = SqliteStore::in_memory().unwrap();
        for day in 1..=6 {
            let date = format!("2024-03-0{day}");
            store.upsert(&rec(&date, "A", day as f64), WriteMode::InsertOnly).unwrap();
        }
        let rows = store.query_latest("A", d("2024-03-05"), 3).unwrap();
        let closes: Vec<_> = rows.iter().filter_map(|r| r.number("close")).collect();
        assert_eq!(closes, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn indicator_upsert_and_lookup() {
        let store = SqliteStore::in_memory().unwrap();
        let first = IndicatorRecord::new(d("2024-03-01"), "A", "sma_5", 10.0);
        assert!(store.upsert_indicator(&first, WriteMode::Replace).unwrap());
        assert!(!store.upsert_indicator(&first, WriteMode::Replace).unwrap());

        let corrected = IndicatorRecord::new(d("2024-03-01"), "A", "sma_5", 10.5);
        assert!(!store.upsert_indicator(&corrected, WriteMode::InsertOnly).unwrap());
        assert!(store.upsert_indicator(&corrected, WriteMode::Replace).unwrap());

        assert_eq!(store.indicator(d("2024-03-01"), "A", "sma_5").unwrap(), Some(10.5));
        assert_eq!(store.indicator(d("2024-03-01"), "A", "sma_10").unwrap(), None);
        assert_eq!(store.indicators_on(d("2024-03-01"), "sma_5").unwrap().len(), 1);
    }

    #[test]
    fn non_finite_indicator_is_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        let bad = IndicatorRecord::new(d("2024-03-01"), "A", "dev_5", f64::NAN);
        assert!(matches!(
            store.upsert_indicator(&bad, WriteMode::Replace),
            Err(StoreError::NonFiniteValue { .. })
        ));
        assert!(store.indicators_on(d("2024-03-01"), "dev_5").unwrap().is_empty());
    }

    #[test]
    fn non_finite_payload_is_rejected_before_write() {
        let store = SqliteStore::in_memory().unwrap();
        let bad = rec("2024-03-01", "A", f64::INFINITY);
        assert!(matches!(
            store.upsert(&bad, WriteMode::Replace),
            Err(StoreError::NonFinitePayload { ref field, .. }) if field == "close"
        ));

        let batch = vec![rec("2024-03-01", "B", 1.0), rec("2024-03-01", "C", f64::NAN)];
        assert!(matches!(
            store.upsert_batch(&batch, WriteMode::InsertOnly),
            Err(StoreError::NonFinitePayload { ref entity, .. }) if entity == "C"
        ));
        assert_eq!(store.count(d("2024-03-01")).unwrap(), 0);
    }

    #[test]
    fn delete_indicator_removes_only_that_key() {
        let store = SqliteStore::in_memory().unwrap();
        for name in ["sma_5", "dev_5"] {
            store
                .upsert_indicator(&IndicatorRecord::new(d("2024-03-01"), "A", name, 1.0), WriteMode::Replace)
                .unwrap();
        }
        assert!(store.delete_indicator(d("2024-03-01"), "A", "dev_5").unwrap());
        assert!(!store.delete_indicator(d("2024-03-01"), "A", "dev_5").unwrap());
        assert_eq!(store.indicator(d("2024-03-01"), "A", "dev_5").unwrap(), None);
        assert_eq!(store.indicator(d("2024-03-01"), "A", "sma_5").unwrap(), Some(1.0));
    }

    #[test]
    fn previous_indicator_date_skips_current() {
        let store = SqliteStore::in_memory().unwrap();
        for date in ["2024-03-01", "2024-03-04", "2024-03-05"] {
            store
                .upsert_indicator(&IndicatorRecord::new(d(date), "A", "sma_50", 1.0), WriteMode::Replace)
                .unwrap();
        }
        assert_eq!(
            store.previous_indicator_date("sma_50", d("2024-03-05")).unwrap(),
            Some(d("2024-03-04"))
        );
        assert_eq!(store.previous_indicator_date("sma_50", d("2024-03-01")).unwrap(), None);
    }

    #[test]
    fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("market.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert(&rec("2024-03-01", "A", 1.0), WriteMode::InsertOnly).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.exists(d("2024-03-01"), "A").unwrap());
    }
}
