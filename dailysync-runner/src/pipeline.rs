//! Pipeline runner: ordered steps with per-step timeout and criticality.
//!
//! Steps run strictly in declaration order, one at a time. Each step runs on
//! its own worker thread so the runner can stop waiting after the step's
//! timeout; a timed-out worker is abandoned and the step is `TimedOut`.
//!
//! State machines:
//! - step: `Pending -> Running -> {Succeeded, Failed, TimedOut}`
//! - pipeline: `Running -> {Completed, Aborted}`
//!
//! A failed or timed-out critical step aborts the run immediately; the
//! remaining steps are listed as not attempted. Non-critical failures are
//! recorded and the run continues. The runner never retries a step.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use dailysync_core::indicators::IndicatorError;
use dailysync_core::store::StoreError;

// ── Step errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("indicator error: {0}")]
    Indicator(#[from] IndicatorError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("step worker panicked")]
    Panicked,
}

// ── States ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Failed | StepState::TimedOut)
    }

    /// `TimedOut` counts as a failure for everything downstream.
    pub fn is_failure(self) -> bool {
        matches!(self, StepState::Failed | StepState::TimedOut)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Running,
    Completed,
    Aborted,
}

// ── Cancellation ─────────────────────────────────────────────────────

/// Shared cancellation flag, checked by the runner between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Steps ────────────────────────────────────────────────────────────

/// Passed to a step's action. Long-running actions can poll the deadline
/// and stop early instead of being abandoned.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub name: String,
    pub run_date: NaiveDate,
    pub deadline: Instant,
}

impl StepContext {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Action body: returns a one-line detail for the report on success.
pub type StepAction = Box<dyn FnOnce(&StepContext) -> Result<String, StepError> + Send + 'static>;

pub struct Step {
    pub name: String,
    pub timeout: Duration,
    pub critical: bool,
    action: StepAction,
}

impl Step {
    pub fn new<F>(name: impl Into<String>, timeout: Duration, critical: bool, action: F) -> Self
    where
        F: FnOnce(&StepContext) -> Result<String, StepError> + Send + 'static,
    {
        Self {
            name: name.into(),
            timeout,
            critical,
            action: Box::new(action),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

// ── Report ───────────────────────────────────────────────────────────

/// Outcome of one executed step. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStepResult {
    pub name: String,
    pub state: StepState,
    pub critical: bool,
    pub duration_ms: u64,
    pub detail: Option<String>,
    pub error: Option<String>,
}

impl PipelineStepResult {
    pub fn succeeded(&self) -> bool {
        self.state == StepState::Succeeded
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Finalized record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_date: NaiveDate,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub state: PipelineState,
    /// Executed steps, in order.
    pub steps: Vec<PipelineStepResult>,
    /// Steps never started because the run aborted first.
    pub not_attempted: Vec<String>,
    pub aborted_by_critical_failure: bool,
    pub cancelled: bool,
}

impl PipelineReport {
    pub fn completed(&self) -> bool {
        self.state == PipelineState::Completed
    }

    /// Process exit code: 0 when completed, 1 when aborted.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            PipelineState::Completed => 0,
            PipelineState::Running | PipelineState::Aborted => 1,
        }
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &PipelineStepResult> {
        self.steps.iter().filter(|s| s.state.is_failure())
    }

    /// The critical step whose failure aborted the run, if any.
    pub fn aborting_step(&self) -> Option<&PipelineStepResult> {
        if !self.aborted_by_critical_failure {
            return None;
        }
        self.steps.last().filter(|s| s.critical && s.state.is_failure())
    }

    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at).to_std().unwrap_or_default()
    }
}

/// Accumulates step results during a run and produces the final report.
struct ReportBuilder {
    run_date: NaiveDate,
    started_at: DateTime<Local>,
    steps: Vec<PipelineStepResult>,
}

impl ReportBuilder {
    fn start(run_date: NaiveDate) -> Self {
        Self {
            run_date,
            started_at: Local::now(),
            steps: Vec::new(),
        }
    }

    fn record(&mut self, result: PipelineStepResult) {
        self.steps.push(result);
    }

    fn finish(
        self,
        state: PipelineState,
        not_attempted: Vec<String>,
        aborted_by_critical_failure: bool,
        cancelled: bool,
    ) -> PipelineReport {
        PipelineReport {
            run_date: self.run_date,
            started_at: self.started_at,
            ended_at: Local::now(),
            state,
            steps: self.steps,
            not_attempted,
            aborted_by_critical_failure,
            cancelled,
        }
    }
}

// ── Runner ───────────────────────────────────────────────────────────

pub struct PipelineRunner {
    run_date: NaiveDate,
    steps: Vec<Step>,
    cancel: CancelToken,
}

impl PipelineRunner {
    pub fn new(run_date: NaiveDate) -> Self {
        Self {
            run_date,
            steps: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Run every step in order and return the finalized report.
    pub fn run(self) -> PipelineReport {
        let mut report = ReportBuilder::start(self.run_date);
        let mut pending = self.steps.into_iter();
        info!(run_date = %self.run_date, "pipeline started");

        while let Some(step) = pending.next() {
            if self.cancel.is_cancelled() {
                warn!(next = %step.name, "pipeline cancelled");
                let not_attempted = std::iter::once(step.name)
                    .chain(pending.map(|s| s.name))
                    .collect();
                return report.finish(PipelineState::Aborted, not_attempted, false, true);
            }

            let result = execute(step, self.run_date);
            let abort = result.critical && result.state.is_failure();
            report.record(result);

            if abort {
                let not_attempted: Vec<String> = pending.map(|s| s.name).collect();
                error!(
                    skipped = not_attempted.len(),
                    "critical step failed, pipeline aborted"
                );
                return report.finish(PipelineState::Aborted, not_attempted, true, false);
            }
        }

        info!("pipeline completed");
        report.finish(PipelineState::Completed, Vec::new(), false, false)
    }
}

/// Longest wait the runner honors; larger step timeouts are clamped so the
/// deadline stays representable as an `Instant`.
pub const MAX_STEP_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Run one step on a worker thread, waiting at most its timeout.
fn execute(step: Step, run_date: NaiveDate) -> PipelineStepResult {
    let Step {
        name,
        timeout,
        critical,
        action,
    } = step;
    let timeout = timeout.min(MAX_STEP_TIMEOUT);
    let started = Instant::now();
    let ctx = StepContext {
        name: name.clone(),
        run_date,
        deadline: started + timeout,
    };
    info!(step = %name, state = %StepState::Running, critical, ?timeout, "step started");

    let (tx, rx) = mpsc::channel();
    let worker = thread::Builder::new()
        .name(format!("step-{name}"))
        .spawn(move || {
            let outcome = action(&ctx);
            // The runner may have stopped listening after a timeout.
            let _ = tx.send(outcome);
        });

    let (state, detail, err) = match worker {
        Err(e) => (StepState::Failed, None, Some(StepError::Io(e))),
        Ok(handle) => match rx.recv_timeout(timeout) {
            Ok(Ok(detail)) => {
                let _ = handle.join();
                (StepState::Succeeded, Some(detail), None)
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                (StepState::Failed, None, Some(e))
            }
            // Dropping the handle detaches the worker.
            Err(RecvTimeoutError::Timeout) => {
                (StepState::TimedOut, None, Some(StepError::TimedOut(timeout)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                (StepState::Failed, None, Some(StepError::Panicked))
            }
        },
    };

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match &err {
        None => info!(step = %name, %state, duration_ms, "step finished"),
        Some(e) if critical => error!(step = %name, %state, duration_ms, error = %e, "critical step failed"),
        Some(e) => warn!(step = %name, %state, duration_ms, error = %e, "step failed, continuing"),
    }

    PipelineStepResult {
        name,
        state,
        critical,
        duration_ms,
        detail,
        error: err.map(|e| e.to_string()),
    }
}
