//! Step builders: turn `[[steps]]` entries into runnable pipeline steps.
//!
//! Every builder captures `Arc` handles to the shared store and source so the
//! action can move onto a worker thread.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{info, warn};

use dailysync_core::data::{DataSourceAdapter, TradingCalendar};
use dailysync_core::indicators::{breadth_on, IndicatorCalculator};
use dailysync_core::store::{SqliteStore, TimeSeriesStore};
use dailysync_core::sync::{SyncEngine, SyncError, SyncSummary};

use crate::config::{DailyConfig, StepConfig, StepKind};
use crate::pipeline::{Step, StepContext, StepError};

const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared collaborators for the configured steps.
#[derive(Clone)]
pub struct StepResources {
    pub store: Arc<SqliteStore>,
    pub source: Arc<dyn DataSourceAdapter>,
    pub calendar: Arc<dyn TradingCalendar>,
}

/// Build every configured step for `run_date`, in declaration order.
pub fn build_steps(config: &DailyConfig, resources: &StepResources, run_date: NaiveDate) -> Vec<Step> {
    config
        .steps
        .iter()
        .map(|step| build_step(config, step, resources, run_date))
        .collect()
}

pub fn build_step(
    config: &DailyConfig,
    step: &StepConfig,
    resources: &StepResources,
    run_date: NaiveDate,
) -> Step {
    let critical = config.is_critical(step);
    let timeout = step.timeout();
    let name = step.name.clone();
    match step.kind {
        StepKind::Sync => {
            let action = sync_action(config, step, resources, run_date);
            Step::new(name, timeout, critical, action)
        }
        StepKind::Indicators => {
            let action = indicators_action(config, resources, run_date);
            Step::new(name, timeout, critical, action)
        }
        StepKind::Breadth => {
            let action = breadth_action(config, resources, run_date);
            Step::new(name, timeout, critical, action)
        }
        StepKind::Command => {
            let action = command_action(step);
            Step::new(name, timeout, critical, action)
        }
    }
}

type Action = Box<dyn FnOnce(&StepContext) -> Result<String, StepError> + Send + 'static>;

fn sync_action(
    config: &DailyConfig,
    step: &StepConfig,
    resources: &StepResources,
    run_date: NaiveDate,
) -> Action {
    let store = Arc::clone(&resources.store);
    let source = Arc::clone(&resources.source);
    let calendar = Arc::clone(&resources.calendar);
    let sync = config.sync.clone();
    let require_as_of = step.require_as_of;

    Box::new(move |_ctx: &StepContext| {
        let engine = SyncEngine::new(store.as_ref(), source.as_ref(), &sync.mapping)
            .with_retry(sync.retry_policy())
            .with_scope(sync.scope());
        let outcomes = engine.sync_as_of(run_date, sync.lookback_days, sync.min_rows_threshold)?;
        let summary = SyncSummary::from_outcomes(&outcomes);

        // Storage failures escalate; source failures stay in the summary.
        if let Some(SyncError::Storage(e)) = outcomes
            .into_iter()
            .filter_map(|o| o.error)
            .find(SyncError::is_storage)
        {
            return Err(StepError::Storage(e));
        }

        if require_as_of && calendar.is_trading_day(run_date) {
            let rows = store.count(run_date)?;
            if rows < sync.min_rows_threshold {
                return Err(StepError::Failed(format!(
                    "{run_date} has {rows} row(s) after sync, expected at least {}",
                    sync.min_rows_threshold
                )));
            }
        }
        Ok(summary.to_string())
    })
}

fn indicators_action(config: &DailyConfig, resources: &StepResources, run_date: NaiveDate) -> Action {
    let store = Arc::clone(&resources.store);
    let calendar = Arc::clone(&resources.calendar);
    let indicators = config.indicators.clone();

    Box::new(move |_ctx: &StepContext| {
        let calculator = IndicatorCalculator::new(store.as_ref(), indicators.field.as_str());
        let batch = calculator.compute_all(run_date, &indicators.windows)?;
        if batch.entities() == 0 {
            if calendar.is_trading_day(run_date) {
                return Err(StepError::Failed(format!(
                    "no records on {run_date}, nothing to compute"
                )));
            }
            return Ok(format!("{run_date} is not a trading day, nothing to compute"));
        }
        Ok(format!(
            "{} indicator record(s) for {} entities ({} with every window)",
            batch.records_written(),
            batch.entities(),
            batch.complete_entities()
        ))
    })
}

fn breadth_action(config: &DailyConfig, resources: &StepResources, run_date: NaiveDate) -> Action {
    let store = Arc::clone(&resources.store);
    let calendar = Arc::clone(&resources.calendar);
    let window = config.breadth.window;
    let field = config.indicators.field.clone();

    Box::new(move |_ctx: &StepContext| {
        let store: &dyn TimeSeriesStore = store.as_ref();
        match breadth_on(store, run_date, window, &field)? {
            Some(summary) => {
                info!(%summary, "market breadth");
                Ok(summary.to_string())
            }
            None if calendar.is_trading_day(run_date) => Err(StepError::Failed(format!(
                "no entity has sma_{window} on {run_date}"
            ))),
            None => Ok(format!("{run_date} is not a trading day, no breadth")),
        }
    })
}

fn command_action(step: &StepConfig) -> Action {
    let program = step.program.clone().unwrap_or_default();
    let args = step.args.clone();
    let workdir: Option<PathBuf> = step.workdir.clone();

    Box::new(move |ctx: &StepContext| {
        let mut command = Command::new(&program);
        command
            .args(&args)
            .env("DAILYSYNC_RUN_DATE", ctx.run_date.format("%Y-%m-%d").to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &workdir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        loop {
            if let Some(status) = child.try_wait()? {
                return if status.success() {
                    Ok(format!("{program} exited successfully"))
                } else {
                    Err(StepError::Failed(format!("{program} exited with {status}")))
                };
            }
            if ctx.is_expired() {
                warn!(step = %ctx.name, program = %program, "deadline reached, killing command");
                let _ = child.kill();
                let _ = child.wait();
                return Err(StepError::Failed(format!("{program} killed at deadline")));
            }
            thread::sleep(COMMAND_POLL_INTERVAL.min(ctx.remaining().max(Duration::from_millis(1))));
        }
    })
}
