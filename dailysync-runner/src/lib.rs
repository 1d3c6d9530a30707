//! dailysync runner: daily pipeline orchestration.
//!
//! This crate builds on `dailysync-core` to provide:
//! - TOML configuration with validation and defaults
//! - The pipeline state machine (ordered steps, timeouts, criticality)
//! - Step builders for sync, indicators, breadth and external commands
//! - Summary rendering, notifier/screenshotter delivery with fallback
//! - JSONL run history

pub mod config;
pub mod daily;
pub mod history;
pub mod notify;
pub mod pipeline;
pub mod steps;
pub mod summary;

pub use config::{ConfigError, DailyConfig, StepConfig, StepKind};
pub use daily::{open_resources, open_source, run_daily, run_with, DailyError, DailyRun};
pub use history::RunHistory;
pub use notify::{
    deliver_summary, Delivery, FileScreenshot, LogNotifier, NoScreenshot, Notifier, NotifyError,
    OutboxNotifier, Screenshotter, WebhookNotifier,
};
pub use pipeline::{
    CancelToken, PipelineReport, PipelineRunner, PipelineState, PipelineStepResult, Step,
    StepContext, StepError, StepState,
};
pub use steps::{build_step, build_steps, StepResources};
pub use summary::render_summary;

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn config_is_send_sync() {
        assert_send::<DailyConfig>();
        assert_sync::<DailyConfig>();
    }

    #[test]
    fn steps_are_send() {
        assert_send::<Step>();
        assert_send::<StepError>();
        assert_send::<StepResources>();
        assert_sync::<StepResources>();
    }

    #[test]
    fn report_is_send_sync() {
        assert_send::<PipelineReport>();
        assert_sync::<PipelineReport>();
        assert_send::<CancelToken>();
        assert_sync::<CancelToken>();
    }

    #[test]
    fn notifiers_are_send_sync() {
        assert_send::<OutboxNotifier>();
        assert_sync::<OutboxNotifier>();
        assert_send::<WebhookNotifier>();
        assert_sync::<WebhookNotifier>();
    }
}
