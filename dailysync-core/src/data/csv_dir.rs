//! CSV drop-directory source: one file per date, `{dir}/{YYYY-MM-DD}.csv`.
//!
//! A missing file means the upstream has nothing for that date yet.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::debug;

use super::provider::{DataSourceAdapter, SourceError, SourceRow};
use crate::domain::FieldValue;

#[derive(Debug, Clone)]
pub struct CsvDirAdapter {
    dir: PathBuf,
    name: String,
}

impl CsvDirAdapter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            name: format!("csv_dir:{}", dir.display()),
            dir,
        }
    }

    /// File that holds the rows for `date`.
    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.csv", date.format("%Y-%m-%d")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DataSourceAdapter for CsvDirAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, date: NaiveDate) -> Result<Vec<SourceRow>, SourceError> {
        let path = self.file_for(date);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no source file for date");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::Reader::from_reader(file);
        let headers = reader.headers()?.clone();
        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            let row: SourceRow = headers
                .iter()
                .zip(record.iter())
                .filter(|(_, cell)| !cell.trim().is_empty())
                .map(|(column, cell)| (column.trim().to_string(), FieldValue::parse_cell(cell)))
                .collect();
            if !row.is_empty() {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn reads_rows_for_date() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("2024-03-01.csv"),
            "entity,close,name\n600000,10.5,bank\n000001,,insurer\n",
        )
        .unwrap();

        let adapter = CsvDirAdapter::new(dir.path());
        let rows = adapter.fetch(d("2024-03-01")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["close"], FieldValue::Number(10.5));
        assert_eq!(rows[0]["name"], FieldValue::Text("bank".into()));
        // Empty cells are omitted rather than stored as empty text
        assert!(!rows[1].contains_key("close"));
    }

    #[test]
    fn missing_file_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = CsvDirAdapter::new(dir.path());
        assert!(adapter.fetch(d("2024-03-02")).unwrap().is_empty());
    }

    #[test]
    fn ragged_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("2024-03-01.csv"), "entity,close\nA,1,extra\n").unwrap();
        let adapter = CsvDirAdapter::new(dir.path());
        assert!(matches!(adapter.fetch(d("2024-03-01")), Err(SourceError::Csv(_))));
    }
}
