//! Build task - submit one build request and wait for it to become ready.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use packo_core::{AttemptSelector, BuildRequest, ConditionType, JobName, WatchFilter};

use crate::error::BuildError;
use crate::group::GroupTask;
use crate::logs::{stream_logs, LineSink, LogSource, LogTarget};
use crate::store::{upsert, ResourceStore, Upserted};
use crate::watcher::{AbortReason, ConditionWatcher, WatchOutcome};

/// Per-task knobs.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    /// Condition that marks the build as done.
    pub condition: ConditionType,

    /// Whether to stream build output while waiting.
    pub stream_logs: bool,

    /// Lines buffered between the log source and the sink.
    pub log_buffer: usize,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            condition: ConditionType::ready(),
            stream_logs: true,
            log_buffer: 64,
        }
    }
}

/// Triggers one build and resolves once the build reports ready.
pub struct BuildTask {
    request: BuildRequest,
    store: Arc<dyn ResourceStore>,
    logs: Arc<dyn LogSource>,
    sink: Arc<dyn LineSink>,
    settings: TaskSettings,
}

impl BuildTask {
    /// Create a new BuildTask.
    pub fn new(
        request: BuildRequest,
        store: Arc<dyn ResourceStore>,
        logs: Arc<dyn LogSource>,
        sink: Arc<dyn LineSink>,
    ) -> Self {
        Self {
            request,
            store,
            logs,
            sink,
            settings: TaskSettings::default(),
        }
    }

    /// Builder method to override the task settings.
    pub fn with_settings(mut self, settings: TaskSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The request this task submits.
    pub fn request(&self) -> &BuildRequest {
        &self.request
    }

    fn spawn_log_consumer(
        &self,
        attempt: AttemptSelector,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let source = self.logs.clone();
        let sink = self.sink.clone();
        let target = LogTarget::new(&self.request.namespace, self.request.name.clone(), attempt);
        let capacity = self.settings.log_buffer;

        tokio::spawn(async move {
            let job = target.job.clone();
            if let Err(e) = stream_logs(source.as_ref(), target, sink, capacity, cancel).await {
                warn!(job = %job, error = %e, "Error streaming build logs");
            }
        })
    }
}

#[async_trait]
impl GroupTask for BuildTask {
    fn name(&self) -> &JobName {
        &self.request.name
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), BuildError> {
        let job = self.request.name.clone();
        self.request.validate().map_err(|source| BuildError::Invalid {
            job: job.clone(),
            source,
        })?;

        let upserted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::Cancelled { job }),
            result = upsert(self.store.as_ref(), self.request.clone()) => {
                result.map_err(|source| BuildError::Upsert { job: job.clone(), source })?
            }
        };

        let record = upserted.record();
        let attempt = AttemptSelector::next_after(record.status.latest_build);
        // A new spec starts a new attempt; the old attempt's Ready must not count.
        let min_build = match attempt {
            AttemptSelector::Build(n) if upserted.triggers_build() => Some(n),
            _ => None,
        };
        info!(
            job = %job,
            created = matches!(upserted, Upserted::Created(_)),
            rebuild = upserted.triggers_build(),
            resource_version = record.meta.resource_version,
            attempt = %attempt,
            tag = %record.spec.tag,
            "Build request submitted"
        );

        let filter = WatchFilter::new(&self.request.namespace, job.clone());
        let feed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::Cancelled { job }),
            result = self.store.subscribe(filter.clone()) => {
                result.map_err(|source| BuildError::Subscribe { job: job.clone(), source })?
            }
        };

        // Both activities stop when this task returns, however it returns.
        let activities = cancel.child_token();
        let _stop = activities.clone().drop_guard();

        let log_consumer = self
            .settings
            .stream_logs
            .then(|| self.spawn_log_consumer(attempt, activities.clone()));

        let (watcher, ready) = ConditionWatcher::new(filter, self.settings.condition.clone());
        let watcher = watcher.with_min_build(min_build);
        let watch = tokio::spawn(watcher.run(feed, activities.clone()));

        let outcome = tokio::select! {
            biased;
            signal = ready => match signal {
                Ok(WatchOutcome::Ready { .. }) => Ok(()),
                Ok(WatchOutcome::Aborted(AbortReason::Cancelled)) => {
                    Err(BuildError::Cancelled { job: job.clone() })
                }
                Ok(WatchOutcome::Aborted(reason)) => Err(BuildError::WatchClosed {
                    job: job.clone(),
                    reason: reason.to_string(),
                }),
                Err(_) => Err(BuildError::WatchClosed {
                    job: job.clone(),
                    reason: "watcher stopped without a result".to_string(),
                }),
            },
            _ = cancel.cancelled() => Err(BuildError::Cancelled { job: job.clone() }),
        };

        activities.cancel();
        if let Err(e) = watch.await {
            warn!(job = %job, error = %e, "Condition watcher failed");
        }
        if let Some(handle) = log_consumer {
            if let Err(e) = handle.await {
                warn!(job = %job, error = %e, "Log consumer failed");
            }
        }

        debug!(job = %job, success = outcome.is_ok(), "Build task finished");
        outcome
    }
}
