//! Run history: JSONL append-only log of finalized pipeline reports.
//!
//! One report per line, so a partially written line only loses that run.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::pipeline::PipelineReport;

pub struct RunHistory {
    path: PathBuf,
}

impl RunHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append a report, creating the file and its directory if needed.
    pub fn append(&self, report: &PipelineReport) -> io::Result<()> {
        let json = serde_json::to_string(report)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{json}")?;
        file.flush()
    }

    /// Read every report. Malformed lines are skipped with a warning.
    pub fn read_all(&self) -> io::Result<Vec<PipelineReport>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut reports = Vec::new();
        for (i, line) in io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PipelineReport>(&line) {
                Ok(report) => reports.push(report),
                Err(e) => warn!(line = i + 1, error = %e, "skipping malformed history line"),
            }
        }
        Ok(reports)
    }

    /// Most recent report, if any.
    pub fn last(&self) -> io::Result<Option<PipelineReport>> {
        Ok(self.read_all()?.pop())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
