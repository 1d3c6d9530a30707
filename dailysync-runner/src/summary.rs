//! Plain-text rendering of a `PipelineReport`, used as the notification body.

use std::fmt::Write;
use std::time::Duration;

use crate::pipeline::{PipelineReport, PipelineState, StepState};

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0 => format!("{}ms", d.as_millis()),
        1..=59 => format!("{:.1}s", d.as_secs_f64()),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}

fn verdict(report: &PipelineReport) -> String {
    match report.state {
        PipelineState::Completed => {
            let failed = report.failed_steps().count();
            if failed == 0 {
                "COMPLETED".to_string()
            } else {
                format!("COMPLETED with {failed} non-critical failure(s)")
            }
        }
        PipelineState::Aborted if report.cancelled => "ABORTED (cancelled)".to_string(),
        PipelineState::Aborted => match report.aborting_step() {
            Some(step) => format!("ABORTED (critical step '{}' {})", step.name, step.state),
            None => "ABORTED".to_string(),
        },
        PipelineState::Running => "RUNNING".to_string(),
    }
}

/// Render the report as a short multi-line summary.
pub fn render_summary(report: &PipelineReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Daily pipeline report {}", report.run_date);
    let _ = writeln!(out, "Started:  {}", report.started_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Finished: {}", report.ended_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Duration: {}", human_duration(report.duration()));
    let _ = writeln!(out, "Steps:");

    for step in &report.steps {
        let tag = match step.state {
            StepState::Succeeded => "[ok]",
            StepState::TimedOut => "[TIMEOUT]",
            _ => "[FAILED]",
        };
        let critical = if step.critical && step.state.is_failure() {
            " (critical)"
        } else {
            ""
        };
        let _ = write!(
            out,
            "  {tag:<9} {}{critical} ({})",
            step.name,
            human_duration(step.duration())
        );
        match (&step.detail, &step.error) {
            (_, Some(error)) => {
                let _ = write!(out, ": {error}");
            }
            (Some(detail), None) if !detail.is_empty() => {
                let _ = write!(out, ": {detail}");
            }
            _ => {}
        }
        out.push('\n');
    }
    for name in &report.not_attempted {
        let _ = writeln!(out, "  {:<9} {name}", "[skipped]");
    }

    let _ = write!(out, "Result: {}", verdict(report));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineRunner, Step, StepError};
    use chrono::NaiveDate;

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 8).unwrap()
    }

    #[test]
    fn aborted_summary_marks_critical_step_and_skips() {
        let report = PipelineRunner::new(run_date())
            .step(Step::new("sync", Duration::from_secs(5), true, |_| Ok("3 dates".into())))
            .step(Step::new("indicators", Duration::from_secs(5), true, |_| {
                Err(StepError::Failed("no records".into()))
            }))
            .step(Step::new("breadth", Duration::from_secs(5), false, |_| Ok(String::new())))
            .run();

        let text = render_summary(&report);
        assert!(text.starts_with("Daily pipeline report 2024-03-08\n"));
        assert!(text.contains("[ok]      sync"));
        assert!(text.contains(": 3 dates"));
        assert!(text.contains("[FAILED]  indicators (critical)"));
        assert!(text.contains(": no records"));
        assert!(text.contains("[skipped] breadth"));
        assert!(text.ends_with("Result: ABORTED (critical step 'indicators' failed)"));
    }

    #[test]
    fn completed_summary_counts_non_critical_failures() {
        let report = PipelineRunner::new(run_date())
            .step(Step::new("extra", Duration::from_secs(5), false, |_| {
                Err(StepError::Failed("flaky".into()))
            }))
            .run();
        let text = render_summary(&report);
        assert!(text.contains("[FAILED]  extra ("));
        assert!(!text.contains("(critical)"));
        assert!(text.ends_with("Result: COMPLETED with 1 non-critical failure(s)"));
    }

    #[test]
    fn durations_are_human_readable() {
        assert_eq!(human_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(human_duration(Duration::from_millis(12_340)), "12.3s");
        assert_eq!(human_duration(Duration::from_secs(251)), "4m 11s");
        assert_eq!(human_duration(Duration::from_secs(7_500)), "2h 5m");
    }
}
