//! dailysync CLI: daily market-data sync and pipeline runner.
//!
//! Commands:
//! - `pipeline`: run the configured steps, deliver the summary, record history
//! - `sync`: fill gaps in the lookback window from the configured source
//! - `gaps`: list under-populated dates without fetching anything
//! - `indicators`: compute rolling indicators (optionally backfilling)
//! - `breadth`: print the share of entities above their moving average

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use dailysync_core::data::{HolidayCalendar, TradingCalendar};
use dailysync_core::indicators::{breadth_on, IndicatorCalculator};
use dailysync_core::store::SqliteStore;
use dailysync_core::sync::{GapDetector, SyncEngine, SyncOutcome, SyncSummary};
use dailysync_runner::{open_source, run_daily, CancelToken, ConfigError, DailyConfig};

#[derive(Parser)]
#[command(name = "dailysync", about = "Daily market-data sync and pipeline runner")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured daily pipeline.
    Pipeline {
        /// Path to the TOML config.
        #[arg(long)]
        config: PathBuf,

        /// Run date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },

    /// Fetch and store rows for every gap in the lookback window.
    Sync {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Override `sync.lookback_days`.
        #[arg(long)]
        lookback: Option<u32>,

        /// Override `sync.min_rows_threshold`.
        #[arg(long)]
        threshold: Option<u64>,
    },

    /// List gap dates in the lookback window.
    Gaps {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        as_of: Option<NaiveDate>,
    },

    /// Compute sma/dev indicators for every entity stored on the date.
    Indicators {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Recompute the last N calendar days instead of a single date.
        #[arg(long)]
        backfill_days: Option<u32>,
    },

    /// Print market breadth for the configured window.
    Breadth {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(error_status(&err))
        }
    }
}

/// Bad configuration exits 2 like a usage error; anything else exits 1.
fn error_status(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        2
    } else {
        1
    }
}

/// `sync` fails only on storage errors. Exhausted source retries are
/// reported but leave the exit status at 0.
fn sync_status(outcomes: &[SyncOutcome]) -> u8 {
    u8::from(outcomes.iter().any(SyncOutcome::is_storage_error))
}

/// First day of a backfill covering `days` calendar days ending at `as_of`.
fn backfill_start(as_of: NaiveDate, days: u32) -> Result<NaiveDate> {
    as_of
        .checked_sub_signed(Duration::days(i64::from(days) - 1))
        .with_context(|| format!("--backfill-days {days} reaches past the earliest supported date"))
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Pipeline { config, as_of } => run_pipeline(&config, as_of),
        Commands::Sync {
            config,
            as_of,
            lookback,
            threshold,
        } => run_sync(&config, as_of, lookback, threshold),
        Commands::Gaps { config, as_of } => run_gaps(&config, as_of),
        Commands::Indicators {
            config,
            as_of,
            backfill_days,
        } => run_indicators(&config, as_of, backfill_days),
        Commands::Breadth { config, as_of } => run_breadth(&config, as_of),
    }
}

fn load_config(path: &Path) -> Result<DailyConfig> {
    let config = DailyConfig::from_file(path)?;
    info!(path = %path.display(), "loaded config");
    Ok(config)
}

fn open_store(config: &DailyConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.store.db_path)
        .with_context(|| format!("open store {}", config.store.db_path.display()))
}

fn resolve_date(as_of: Option<NaiveDate>) -> NaiveDate {
    as_of.unwrap_or_else(|| Local::now().date_naive())
}

fn run_pipeline(config_path: &Path, as_of: Option<NaiveDate>) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let run_date = resolve_date(as_of);

    let run = run_daily(&config, run_date, CancelToken::new())?;
    println!("{}", run.summary);

    let code = u8::try_from(run.report.exit_code()).unwrap_or(1);
    Ok(ExitCode::from(code))
}

fn run_sync(
    config_path: &Path,
    as_of: Option<NaiveDate>,
    lookback: Option<u32>,
    threshold: Option<u64>,
) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let as_of = resolve_date(as_of);
    let lookback = lookback.unwrap_or(config.sync.lookback_days);
    let threshold = threshold.unwrap_or(config.sync.min_rows_threshold);

    let store = open_store(&config)?;
    let source = open_source(&config.sync).context("open source")?;
    let engine = SyncEngine::new(&store, source.as_ref(), &config.sync.mapping)
        .with_retry(config.sync.retry_policy())
        .with_scope(config.sync.scope());

    let outcomes = engine.sync_as_of(as_of, lookback, threshold)?;
    for outcome in &outcomes {
        match &outcome.error {
            Some(err) => eprintln!("{}: {err}", outcome.date),
            None => println!(
                "{}: fetched {}, wrote {}",
                outcome.date, outcome.rows_fetched, outcome.rows_written
            ),
        }
    }
    println!("{}", SyncSummary::from_outcomes(&outcomes));
    Ok(ExitCode::from(sync_status(&outcomes)))
}

fn run_gaps(config_path: &Path, as_of: Option<NaiveDate>) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let as_of = resolve_date(as_of);
    let store = open_store(&config)?;
    let calendar = HolidayCalendar::new(config.calendar.holidays.iter().copied());
    let scope = config.sync.scope();

    let detector = GapDetector::new(&store);
    let gaps = detector.find_gaps(
        &scope,
        config.sync.lookback_days,
        config.sync.min_rows_threshold,
        as_of,
    )?;

    if gaps.is_empty() {
        println!(
            "No gaps in the {} day(s) ending {as_of}",
            config.sync.lookback_days
        );
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<12} {:>8}  NOTE", "DATE", "ROWS");
    for date in gaps {
        let rows = detector.population(&scope, date)?;
        let note = if calendar.is_trading_day(date) {
            ""
        } else {
            "non-trading day"
        };
        println!("{:<12} {rows:>8}  {note}", date.to_string());
    }
    Ok(ExitCode::SUCCESS)
}

fn run_indicators(
    config_path: &Path,
    as_of: Option<NaiveDate>,
    backfill_days: Option<u32>,
) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let as_of = resolve_date(as_of);
    let store = open_store(&config)?;
    let windows = &config.indicators.windows;
    let calculator = IndicatorCalculator::new(&store, config.indicators.field.as_str());

    if let Some(days) = backfill_days.filter(|&d| d > 0) {
        let from = backfill_start(as_of, days)?;
        let written = calculator.backfill_all(from, as_of, windows)?;
        println!("Backfilled {from}..={as_of}: {written} indicator record(s) written");
        return Ok(ExitCode::SUCCESS);
    }

    let batch = calculator.compute_all(as_of, windows)?;
    if batch.entities() == 0 {
        println!("No records stored on {as_of}");
        return Ok(ExitCode::SUCCESS);
    }
    println!(
        "{as_of}: {} entities, {} complete, {} indicator record(s) written",
        batch.entities(),
        batch.complete_entities(),
        batch.records_written()
    );
    Ok(ExitCode::SUCCESS)
}

fn run_breadth(config_path: &Path, as_of: Option<NaiveDate>) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let as_of = resolve_date(as_of);
    let store = open_store(&config)?;

    match breadth_on(&store, as_of, config.breadth.window, &config.indicators.field)? {
        Some(summary) => println!("{summary}"),
        None => println!(
            "No sma_{} values stored on {as_of}",
            config.breadth.window
        ),
    }
    Ok(ExitCode::SUCCESS)
}
