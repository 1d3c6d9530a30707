//! Versioned DDL, applied once per database and tracked in `schema_migrations`.

use rusqlite::{params, Connection};
use tracing::debug;

const CREATE_MIGRATIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_dated_records",
        sql: r"
CREATE TABLE IF NOT EXISTS dated_records (
    date TEXT NOT NULL,
    entity TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (date, entity)
);

CREATE INDEX IF NOT EXISTS idx_dated_records_entity_date ON dated_records (entity, date);
",
    },
    Migration {
        version: "0002_indicator_records",
        sql: r"
CREATE TABLE IF NOT EXISTS indicator_records (
    date TEXT NOT NULL,
    entity TEXT NOT NULL,
    indicator TEXT NOT NULL,
    value REAL NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (date, entity, indicator)
);

CREATE INDEX IF NOT EXISTS idx_indicator_records_indicator_date ON indicator_records (indicator, date);
",
    },
];

/// Apply every migration not yet recorded. Returns how many were applied.
pub fn apply_migrations(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute_batch(CREATE_MIGRATIONS_TABLE)?;
    let mut applied = 0;
    for migration in MIGRATIONS {
        let done: i64 = conn.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
            params![migration.version],
            |row| row.get(0),
        )?;
        if done > 0 {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            params![migration.version],
        )?;
        tx.commit()?;
        debug!(version = migration.version, "applied schema migration");
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(apply_migrations(&conn).unwrap(), MIGRATIONS.len());
        assert_eq!(apply_migrations(&conn).unwrap(), 0);

        let recorded: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(recorded as usize, MIGRATIONS.len());
    }
}
