//! Daily run configuration, loaded from TOML.
//!
//! Every section has defaults, so a minimal file only needs
//! `[sync.source]`. Defaults: lookback 5 days, threshold 100 rows,
//! 3 fetch attempts 2 s apart, windows 5/10/50.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dailysync_core::data::FieldMapping;
use dailysync_core::sync::{EntityScope, RetryPolicy};

use crate::pipeline::MAX_STEP_TIMEOUT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Complete configuration for a daily run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyConfig {
    #[serde(default)]
    pub store: StoreConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub indicators: IndicatorConfig,
    #[serde(default)]
    pub breadth: BreadthConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    /// Per-step criticality overrides, keyed by step name.
    #[serde(default)]
    pub criticality: BTreeMap<String, bool>,
    #[serde(default = "default_steps")]
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/market.db")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_min_rows_threshold")]
    pub min_rows_threshold: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Restrict gap counting to these entities. Empty means all entities.
    #[serde(default)]
    pub entities: Vec<String>,
    pub source: SourceConfig,
    #[serde(default)]
    pub mapping: FieldMapping,
}

fn default_lookback_days() -> u32 {
    5
}
fn default_min_rows_threshold() -> u64 {
    100
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn scope(&self) -> EntityScope {
        if self.entities.is_empty() {
            EntityScope::AllEntities
        } else {
            EntityScope::Entities(self.entities.clone())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// One CSV file per date in a directory.
    CsvDir,
    /// Rows read from another SQLite database.
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub path: PathBuf,
    /// Parameterized query for `sqlite` sources, binding the date as `?1`.
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default = "default_windows")]
    pub windows: Vec<usize>,
    #[serde(default = "default_field")]
    pub field: String,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            windows: default_windows(),
            field: default_field(),
        }
    }
}

fn default_windows() -> Vec<usize> {
    vec![5, 10, 50]
}
fn default_field() -> String {
    "close".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreadthConfig {
    #[serde(default = "default_breadth_window")]
    pub window: usize,
}

impl Default for BreadthConfig {
    fn default() -> Self {
        Self {
            window: default_breadth_window(),
        }
    }
}

fn default_breadth_window() -> usize {
    50
}

/// Holidays are listed as quoted `"YYYY-MM-DD"` strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    #[default]
    Log,
    Outbox,
    Webhook,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenshotKind {
    #[default]
    None,
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub kind: NotifierKind,
    /// Directory for `outbox` delivery.
    #[serde(default)]
    pub outbox_dir: Option<PathBuf>,
    /// Endpoint for `webhook` delivery.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub screenshot: ScreenshotKind,
    /// Pre-rendered image attached by the `file` screenshotter.
    #[serde(default)]
    pub screenshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// JSONL file receiving one report per run. Unset disables history.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Sync,
    Indicators,
    Breadth,
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    pub kind: StepKind,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_critical")]
    pub critical: bool,
    /// `sync` steps: fail unless the run date is populated afterwards
    /// (trading days only).
    #[serde(default)]
    pub require_as_of: bool,
    /// `command` steps: program and arguments.
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
    300
}
fn default_critical() -> bool {
    true
}

impl StepConfig {
    pub fn new(name: &str, kind: StepKind, timeout_secs: u64, critical: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            timeout_secs,
            critical,
            require_as_of: false,
            program: None,
            args: Vec::new(),
            workdir: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_steps() -> Vec<StepConfig> {
    vec![
        StepConfig::new("sync", StepKind::Sync, 600, true),
        StepConfig::new("indicators", StepKind::Indicators, 300, true),
        StepConfig::new("breadth", StepKind::Breadth, 120, false),
    ]
}

impl DailyConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.sync.lookback_days == 0 {
            return invalid("sync.lookback_days must be >= 1".into());
        }
        if self.sync.max_attempts == 0 {
            return invalid("sync.max_attempts must be >= 1".into());
        }
        if self.indicators.windows.is_empty() {
            return invalid("indicators.windows must not be empty".into());
        }
        if self.indicators.windows.contains(&0) {
            return invalid("indicators.windows must all be >= 1".into());
        }
        if self.breadth.window == 0 {
            return invalid("breadth.window must be >= 1".into());
        }
        let has_breadth_step = self.steps.iter().any(|s| s.kind == StepKind::Breadth);
        if has_breadth_step && !self.indicators.windows.contains(&self.breadth.window) {
            return invalid(format!(
                "breadth.window {} is not one of indicators.windows {:?}",
                self.breadth.window, self.indicators.windows
            ));
        }
        if self.sync.source.kind == SourceKind::CsvDir && self.sync.source.query.is_some() {
            return invalid("sync.source.query only applies to sqlite sources".into());
        }

        let mut names = BTreeSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return invalid(format!("duplicate step name '{}'", step.name));
            }
            if step.timeout_secs == 0 {
                return invalid(format!("step '{}' needs a timeout >= 1s", step.name));
            }
            if step.timeout() > MAX_STEP_TIMEOUT {
                return invalid(format!(
                    "step '{}' timeout exceeds {}s",
                    step.name,
                    MAX_STEP_TIMEOUT.as_secs()
                ));
            }
            if step.kind == StepKind::Command && step.program.is_none() {
                return invalid(format!("command step '{}' has no program", step.name));
            }
        }
        for name in self.criticality.keys() {
            if !names.contains(name.as_str()) {
                return invalid(format!("criticality override for unknown step '{name}'"));
            }
        }

        match self.notify.kind {
            NotifierKind::Outbox if self.notify.outbox_dir.is_none() => {
                return invalid("notify.kind = \"outbox\" requires notify.outbox_dir".into())
            }
            NotifierKind::Webhook if self.notify.webhook_url.is_none() => {
                return invalid("notify.kind = \"webhook\" requires notify.webhook_url".into())
            }
            _ => {}
        }
        if self.notify.screenshot == ScreenshotKind::File && self.notify.screenshot_path.is_none() {
            return invalid("notify.screenshot = \"file\" requires notify.screenshot_path".into());
        }
        Ok(())
    }

    /// Criticality of a step after applying `[criticality]` overrides.
    pub fn is_critical(&self, step: &StepConfig) -> bool {
        self.criticality
            .get(&step.name)
            .copied()
            .unwrap_or(step.critical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[sync.source]
kind = "csv_dir"
path = "inbox"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = DailyConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.store.db_path, PathBuf::from("data/market.db"));
        assert_eq!(config.sync.lookback_days, 5);
        assert_eq!(config.sync.min_rows_threshold, 100);
        assert_eq!(config.sync.retry_policy().max_attempts, 3);
        assert_eq!(config.sync.retry_policy().delay, Duration::from_secs(2));
        assert_eq!(config.indicators.windows, vec![5, 10, 50]);
        assert_eq!(config.breadth.window, 50);
        assert_eq!(config.notify.kind, NotifierKind::Log);
        assert_eq!(config.sync.scope(), EntityScope::AllEntities);
        let names: Vec<_> = config.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["sync", "indicators", "breadth"]);
    }

    #[test]
    fn full_config_parses() {
        let toml = r#"
[store]
db_path = "/var/lib/market.db"

[sync]
lookback_days = 7
min_rows_threshold = 4000
max_attempts = 5
retry_delay_ms = 500
entities = ["600000", "000001"]

[sync.source]
kind = "sqlite"
path = "upstream.db"
query = "SELECT * FROM stock_history WHERE trade_date = ?1"

[sync.mapping]
entity_field = "stock_code"
date_field = "trade_date"
renames = { close_price = "close" }

[indicators]
windows = [20, 60]

[calendar]
holidays = ["2024-10-01", "2024-10-02"]

[notify]
kind = "outbox"
outbox_dir = "outbox"
screenshot = "file"
screenshot_path = "report.png"

[history]
path = "runs.jsonl"

[criticality]
deploy = false

[[steps]]
name = "sync"
kind = "sync"
timeout_secs = 1800
require_as_of = true

[[steps]]
name = "deploy"
kind = "command"
program = "./deploy.sh"
args = ["--prod"]
"#;
        let config = DailyConfig::from_toml(toml).unwrap();
        assert_eq!(config.sync.source.kind, SourceKind::Sqlite);
        assert_eq!(config.sync.mapping.entity_field, "stock_code");
        assert_eq!(config.sync.mapping.renames["close_price"], "close");
        assert_eq!(config.calendar.holidays.len(), 2);
        assert_eq!(config.steps.len(), 2);
        assert!(config.steps[0].require_as_of);
        assert_eq!(config.steps[1].timeout(), Duration::from_secs(300));
        // Declared critical by default, overridden by [criticality]
        assert!(config.steps[1].critical);
        assert!(!config.is_critical(&config.steps[1]));
        assert!(config.is_critical(&config.steps[0]));
        assert!(matches!(config.sync.scope(), EntityScope::Entities(ref e) if e.len() == 2));
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            ("[sync]\nlookback_days = 0\n", "lookback_days"),
            ("[sync]\nmax_attempts = 0\n", "max_attempts"),
            ("[indicators]\nwindows = []\n", "windows"),
            ("[indicators]\nwindows = [5, 0]\n", "windows"),
            (
                "[[steps]]\nname = \"a\"\nkind = \"sync\"\n[[steps]]\nname = \"a\"\nkind = \"breadth\"\n",
                "duplicate step",
            ),
            ("[[steps]]\nname = \"x\"\nkind = \"command\"\n", "no program"),
            ("[criticality]\nghost = true\n", "unknown step"),
            ("[notify]\nkind = \"webhook\"\n", "webhook_url"),
            ("[indicators]\nwindows = [20, 60]\n", "breadth.window"),
            (
                "[[steps]]\nname = \"s\"\nkind = \"sync\"\ntimeout_secs = 9223372036854775807\n",
                "timeout exceeds",
            ),
        ];
        for (extra, needle) in cases {
            let toml = format!("{MINIMAL}\n{extra}");
            let toml = merge_sync_table(&toml);
            match DailyConfig::from_toml(&toml) {
                Err(ConfigError::Invalid(msg)) => assert!(msg.contains(needle), "{msg} / {needle}"),
                other => panic!("expected Invalid containing {needle:?}, got {other:?}"),
            }
        }
    }

    /// Move the `[sync.source]` table below the snippet so a `[sync]`
    /// header in the snippet reads as its parent.
    fn merge_sync_table(toml: &str) -> String {
        let source = "[sync.source]\nkind = \"csv_dir\"\npath = \"inbox\"\n";
        format!("{}\n{source}", toml.replace(source, ""))
    }

    #[test]
    fn breadth_window_only_matters_with_a_breadth_step() {
        let toml = format!(
            "{MINIMAL}\n[indicators]\nwindows = [20, 60]\n\n[[steps]]\nname = \"sync\"\nkind = \"sync\"\n"
        );
        let config = DailyConfig::from_toml(&merge_sync_table(&toml)).unwrap();
        assert_eq!(config.breadth.window, 50);

        let toml = format!("{MINIMAL}\n[indicators]\nwindows = [20, 60]\n\n[breadth]\nwindow = 20\n");
        assert!(DailyConfig::from_toml(&merge_sync_table(&toml)).is_ok());
    }

    #[test]
    fn unknown_source_kind_is_a_parse_error() {
        let toml = "[sync.source]\nkind = \"ftp\"\npath = \"x\"\n";
        assert!(matches!(
            DailyConfig::from_toml(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = DailyConfig::from_file(Path::new("/nonexistent/daily.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
