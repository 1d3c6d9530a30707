//! Daily run: wires configuration, store, source and steps together,
//! runs the pipeline, then delivers the summary and records history.

use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{info, warn};

use dailysync_core::data::{
    CsvDirAdapter, DataSourceAdapter, HolidayCalendar, SourceError, SqliteSourceAdapter,
};
use dailysync_core::store::{SqliteStore, StoreError};

use crate::config::{DailyConfig, SourceKind, SyncConfig};
use crate::history::RunHistory;
use crate::notify::{build_notifier, build_screenshotter, deliver_summary, Delivery, LogNotifier, Notifier};
use crate::pipeline::{CancelToken, PipelineReport, PipelineRunner};
use crate::steps::{build_steps, StepResources};
use crate::summary::render_summary;

/// Failures that prevent a run from starting at all.
#[derive(Debug, Error)]
pub enum DailyError {
    #[error("open store: {0}")]
    Store(#[from] StoreError),

    #[error("open source: {0}")]
    Source(#[from] SourceError),
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct DailyRun {
    pub report: PipelineReport,
    pub summary: String,
    pub delivery: Delivery,
}

/// Build the configured upstream adapter.
pub fn open_source(sync: &SyncConfig) -> Result<Arc<dyn DataSourceAdapter>, SourceError> {
    match sync.source.kind {
        SourceKind::CsvDir => Ok(Arc::new(CsvDirAdapter::new(&sync.source.path))),
        SourceKind::Sqlite => Ok(Arc::new(SqliteSourceAdapter::open(
            &sync.source.path,
            sync.source.query.as_deref(),
        )?)),
    }
}

/// Open the store, source and calendar described by `config`.
pub fn open_resources(config: &DailyConfig) -> Result<StepResources, DailyError> {
    let store = Arc::new(SqliteStore::open(&config.store.db_path)?);
    let source = open_source(&config.sync)?;
    let calendar = Arc::new(HolidayCalendar::new(config.calendar.holidays.iter().copied()));
    Ok(StepResources {
        store,
        source,
        calendar,
    })
}

/// Run the configured pipeline for `run_date` against already-open resources.
pub fn run_with(
    config: &DailyConfig,
    resources: &StepResources,
    run_date: NaiveDate,
    cancel: CancelToken,
) -> DailyRun {
    let mut runner = PipelineRunner::new(run_date).with_cancel_token(cancel);
    for step in build_steps(config, resources, run_date) {
        runner.push(step);
    }
    info!(%run_date, steps = ?runner.step_names(), source = resources.source.name(), "daily run starting");
    let report = runner.run();
    let summary = render_summary(&report);

    let delivery = match build_notifier(&config.notify) {
        Ok(notifier) => {
            let screenshotter = build_screenshotter(&config.notify);
            deliver_summary(notifier.as_ref(), screenshotter.as_ref(), run_date, &summary)
        }
        Err(e) => {
            warn!(error = %e, "notifier unavailable, logging summary");
            let _ = LogNotifier.send(&summary, None);
            Delivery::LogOnly
        }
    };

    if let Some(path) = &config.history.path {
        if let Err(e) = RunHistory::new(path).append(&report) {
            warn!(path = %path.display(), error = %e, "failed to append run history");
        }
    }

    DailyRun {
        report,
        summary,
        delivery,
    }
}

/// Open everything from `config` and run the pipeline for `run_date`.
pub fn run_daily(
    config: &DailyConfig,
    run_date: NaiveDate,
    cancel: CancelToken,
) -> Result<DailyRun, DailyError> {
    let resources = open_resources(config)?;
    Ok(run_with(config, &resources, run_date, cancel))
}
