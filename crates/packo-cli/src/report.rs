//! Result reporting for a finished build group.

use std::io::{self, Write};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use packo_build::{GroupOutcome, GroupReport, TaskResult};

/// Event types emitted in JSON mode.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportEvent {
    TaskSucceeded,
    TaskFailed,
    GroupSucceeded,
    GroupFailed,
}

/// One JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct JsonLine {
    pub event: ReportEvent,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl JsonLine {
    fn task(result: &TaskResult, timestamp: &DateTime<Utc>) -> Self {
        let (event, error) = match &result.outcome {
            Ok(()) => (ReportEvent::TaskSucceeded, None),
            Err(cause) => (ReportEvent::TaskFailed, Some(cause.to_string())),
        };
        Self {
            event,
            timestamp: timestamp.to_rfc3339(),
            data: serde_json::json!({
                "job": result.job,
                "elapsed_ms": millis(result.elapsed),
                "error": error,
            }),
        }
    }

    fn group(report: &GroupReport, started_at: &DateTime<Utc>, finished_at: &DateTime<Utc>) -> Self {
        let event = match report.outcome {
            GroupOutcome::Success => ReportEvent::GroupSucceeded,
            GroupOutcome::Failure(_) => ReportEvent::GroupFailed,
        };
        Self {
            event,
            timestamp: finished_at.to_rfc3339(),
            data: serde_json::json!({
                "tasks": report.results.len(),
                "succeeded": report.succeeded(),
                "started_at": started_at.to_rfc3339(),
                "elapsed_ms": millis(report.elapsed),
                "error": report.outcome.cause().map(|c| c.to_string()),
            }),
        }
    }
}

/// Writes a [`GroupReport`] for a human or as JSON lines.
pub struct Reporter {
    json: bool,
}

impl Reporter {
    /// Create a new Reporter.
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Write one line per task, then the group summary.
    pub fn write<W: Write>(
        &self,
        out: &mut W,
        report: &GroupReport,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> io::Result<()> {
        if self.json {
            for result in &report.results {
                write_json(out, &JsonLine::task(result, &finished_at))?;
            }
            write_json(out, &JsonLine::group(report, &started_at, &finished_at))?;
        } else {
            for result in &report.results {
                match &result.outcome {
                    Ok(()) => writeln!(out, "✓ {} ({})", result.job, seconds(result.elapsed))?,
                    Err(cause) => writeln!(out, "✗ {}: {}", result.job, cause)?,
                }
            }
            match &report.outcome {
                GroupOutcome::Success => writeln!(
                    out,
                    "All {} builds succeeded in {}",
                    report.results.len(),
                    seconds(report.elapsed)
                )?,
                GroupOutcome::Failure(cause) => writeln!(
                    out,
                    "Build group failed after {} ({} of {} succeeded): {}",
                    seconds(report.elapsed),
                    report.succeeded(),
                    report.results.len(),
                    cause
                )?,
            }
        }
        out.flush()
    }
}

fn write_json<W: Write>(out: &mut W, line: &JsonLine) -> io::Result<()> {
    let json = serde_json::to_string(line).map_err(io::Error::other)?;
    writeln!(out, "{}", json)
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn seconds(d: Duration) -> String {
    format!("{:.1}s", d.as_secs_f64())
}
