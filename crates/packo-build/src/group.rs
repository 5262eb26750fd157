//! Build group orchestrator - runs tasks concurrently, first failure cancels the rest.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use packo_core::JobName;

use crate::error::BuildError;

/// A unit of work the orchestrator can launch.
///
/// `run` must return on every path, including when `cancel` fires.
#[async_trait]
pub trait GroupTask: Send + Sync {
    /// Task identity, used to label its result.
    fn name(&self) -> &JobName;

    /// Run to completion or until cancelled.
    async fn run(&self, cancel: CancellationToken) -> Result<(), BuildError>;
}

/// A [`GroupTask`] backed by a closure.
pub struct FnTask<F> {
    name: JobName,
    f: F,
}

impl<F, Fut> FnTask<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BuildError>> + Send,
{
    /// Create a new FnTask.
    pub fn new(name: impl Into<JobName>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> GroupTask for FnTask<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BuildError>> + Send,
{
    fn name(&self) -> &JobName {
        &self.name
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), BuildError> {
        (self.f)(cancel).await
    }
}

/// Outcome of one launched task. Exactly one is produced per task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Which task.
    pub job: JobName,
    /// Success, or the cause of failure.
    pub outcome: Result<(), BuildError>,
    /// Wall time from launch to result.
    pub elapsed: Duration,
}

impl TaskResult {
    /// Returns true if the task succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Aggregate over all task results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    /// Every task succeeded (vacuously true for an empty group).
    Success,
    /// At least one task failed; carries the first failure observed.
    Failure(BuildError),
}

impl GroupOutcome {
    /// Returns true on success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The surfaced cause, if failed.
    pub fn cause(&self) -> Option<&BuildError> {
        match self {
            Self::Success => None,
            Self::Failure(cause) => Some(cause),
        }
    }
}

/// Everything a group run produced.
#[derive(Debug, Clone)]
pub struct GroupReport {
    /// Aggregate outcome.
    pub outcome: GroupOutcome,
    /// One result per task, in arrival order.
    pub results: Vec<TaskResult>,
    /// Wall time of the whole group.
    pub elapsed: Duration,
}

impl GroupReport {
    /// Result of a given task.
    pub fn result_for(&self, job: &JobName) -> Option<&TaskResult> {
        self.results.iter().find(|r| &r.job == job)
    }

    /// Number of successful tasks.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }
}

/// Run every task concurrently and wait for all of them.
///
/// Tasks share a token derived from `base`. The first failure observed
/// cancels that token; `base` itself is never cancelled. Returns only after
/// every task has produced its result.
pub async fn run_group(base: &CancellationToken, tasks: Vec<Arc<dyn GroupTask>>) -> GroupReport {
    let started = Instant::now();
    let expected = tasks.len();

    if tasks.is_empty() {
        info!("No tasks to run");
        return GroupReport {
            outcome: GroupOutcome::Success,
            results: Vec::new(),
            elapsed: started.elapsed(),
        };
    }

    info!(tasks = expected, "Launching build group");

    let cancel = base.child_token();
    // One slot per task so no sender ever waits on the collector.
    let (tx, rx) = mpsc::channel::<TaskResult>(expected);

    let mut handles = Vec::with_capacity(expected);
    for task in tasks {
        let tx = tx.clone();
        let token = cancel.clone();
        let base = base.clone();
        handles.push(tokio::spawn(async move {
            let result = run_task(task, token, &base).await;
            if tx.send(result).await.is_err() {
                warn!("Result collector gone, dropping task result");
            }
        }));
    }
    drop(tx);

    let join = async {
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Task wrapper failed");
            }
        }
    };

    // The channel closes once the last wrapper has sent its result.
    let ((), (results, first_failure)) = tokio::join!(join, collect(rx, &cancel));

    if results.len() != expected {
        error!(expected, received = results.len(), "Missing task results");
    }

    let outcome = match first_failure {
        Some(cause) => GroupOutcome::Failure(cause),
        None if results.len() == expected => GroupOutcome::Success,
        None => GroupOutcome::Failure(BuildError::Panicked {
            job: JobName::new("build-group"),
            message: format!("{} of {} task results lost", expected - results.len(), expected),
        }),
    };

    let elapsed = started.elapsed();
    match &outcome {
        GroupOutcome::Success => info!(
            tasks = expected,
            elapsed_ms = elapsed.as_millis() as u64,
            "Build group succeeded"
        ),
        GroupOutcome::Failure(cause) => error!(
            tasks = expected,
            elapsed_ms = elapsed.as_millis() as u64,
            error = %cause,
            "Build group failed"
        ),
    }

    GroupReport {
        outcome,
        results,
        elapsed,
    }
}

/// Run one task, turning a panic into a failure result.
///
/// A cancellation that came from `base` is reported as an interruption, not
/// as a sibling failure.
async fn run_task(
    task: Arc<dyn GroupTask>,
    cancel: CancellationToken,
    base: &CancellationToken,
) -> TaskResult {
    let job = task.name().clone();
    let started = Instant::now();
    debug!(job = %job, "Task started");

    let outcome = match AssertUnwindSafe(task.run(cancel)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(BuildError::Panicked {
            job: job.clone(),
            message: panic_message(panic.as_ref()),
        }),
    };

    let outcome = match outcome {
        Err(BuildError::Cancelled { job }) if base.is_cancelled() => {
            Err(BuildError::Interrupted { job })
        }
        other => other,
    };

    TaskResult {
        job,
        outcome,
        elapsed: started.elapsed(),
    }
}

/// Drain results until the channel closes, cancelling on the first failure.
async fn collect(
    mut rx: mpsc::Receiver<TaskResult>,
    cancel: &CancellationToken,
) -> (Vec<TaskResult>, Option<BuildError>) {
    let mut results = Vec::new();
    let mut first_failure: Option<BuildError> = None;

    while let Some(result) = rx.recv().await {
        match &result.outcome {
            Ok(()) => info!(
                job = %result.job,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "Task succeeded"
            ),
            Err(cause) if first_failure.is_none() => {
                error!(job = %result.job, error = %cause, "Task failed, cancelling remaining tasks");
                first_failure = Some(cause.clone());
                cancel.cancel();
            }
            Err(cause) if cause.is_cancelled() => {
                debug!(job = %result.job, "Task cancelled");
            }
            Err(cause) => {
                warn!(job = %result.job, error = %cause, "Task also failed");
            }
        }
        results.push(result);
    }

    (results, first_failure)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
