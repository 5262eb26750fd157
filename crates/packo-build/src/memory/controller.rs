//! Simulated build controller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use packo_core::{BuildRecord, BuildRequest, ChangeEvent, ConditionStatus, ConditionType, JobName};

use super::{MemoryLogSource, MemoryStore};

type Key = (String, JobName);

/// Reacts to new or changed build requests the way a build controller does:
/// bumps the build counter, writes output, then flips `Ready`.
///
/// Status-only writes (including its own) do not start a build.
pub struct SimulatedController {
    store: Arc<MemoryStore>,
    logs: Arc<MemoryLogSource>,
    build_duration: Duration,
    failing: HashSet<JobName>,
}

impl SimulatedController {
    /// Create a new SimulatedController.
    pub fn new(store: Arc<MemoryStore>, logs: Arc<MemoryLogSource>) -> Self {
        Self {
            store,
            logs,
            build_duration: Duration::from_secs(2),
            failing: HashSet::new(),
        }
    }

    /// Builder method to set how long each build takes.
    pub fn with_build_duration(mut self, duration: Duration) -> Self {
        self.build_duration = duration;
        self
    }

    /// Builder method to make every build of `job` end with `Ready=False`.
    pub fn with_failing_job(mut self, job: JobName) -> Self {
        self.failing.insert(job);
        self
    }

    /// Start reconciling until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        // Subscribe before returning so no request written afterwards is missed.
        let events = self.store.events();
        tokio::spawn(self.run(events, cancel))
    }

    async fn run(
        self,
        mut events: tokio::sync::broadcast::Receiver<ChangeEvent>,
        cancel: CancellationToken,
    ) {
        let this = Arc::new(self);
        let mut built: HashMap<Key, BuildRequest> = HashMap::new();
        let mut counters: HashMap<Key, u64> = HashMap::new();

        info!(build_duration_ms = this.build_duration.as_millis() as u64, "Simulated controller started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            let record = match event {
                Ok(ChangeEvent::Added(record)) | Ok(ChangeEvent::Updated(record)) => record,
                Ok(ChangeEvent::Deleted(record)) => {
                    let key = (record.meta.namespace.clone(), record.meta.name.clone());
                    built.remove(&key);
                    continue;
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Controller fell behind the change feed");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let key = (record.meta.namespace.clone(), record.meta.name.clone());
            if built.get(&key) == Some(&record.spec) {
                continue;
            }
            built.insert(key.clone(), record.spec.clone());

            let counter = counters
                .entry(key)
                .or_insert_with(|| record.status.latest_build.unwrap_or(0));
            *counter += 1;
            let attempt = *counter;

            let controller = this.clone();
            let build_cancel = cancel.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = build_cancel.cancelled() => {}
                    _ = controller.build(record, attempt) => {}
                }
            });
        }

        debug!("Simulated controller stopped");
    }

    async fn build(&self, record: BuildRecord, attempt: u64) {
        let namespace = record.meta.namespace.as_str();
        let job = record.meta.name.clone();
        let ready = ConditionType::ready();

        info!(job = %job, attempt, "Starting build");
        let started = self
            .store
            .update_status(namespace, &job, |status| {
                status.latest_build = Some(attempt);
                status.set_condition(ready.clone(), ConditionStatus::Unknown, None);
            })
            .await;
        if let Err(e) = started {
            warn!(job = %job, error = %e, "Could not record build start");
            return;
        }

        let target = record
            .spec
            .env
            .get(packo_core::request::GO_TARGETS_ENV)
            .cloned()
            .unwrap_or_else(|| ".".to_string());
        for line in [
            "===> DETECTING".to_string(),
            format!("Using builder {}", record.spec.builder),
            format!("Restoring source {}", record.spec.source),
            "===> BUILDING".to_string(),
            format!("Building {}", target),
        ] {
            self.logs.append(namespace, &job, attempt, line).await;
        }

        tokio::time::sleep(self.build_duration).await;

        let failed = self.failing.contains(&job);
        if failed {
            self.logs
                .append(namespace, &job, attempt, format!("ERROR: failed to build {}", target))
                .await;
        } else {
            self.logs.append(namespace, &job, attempt, "===> EXPORTING").await;
            self.logs
                .append(namespace, &job, attempt, format!("Saved image {}", record.spec.tag))
                .await;
        }
        self.logs.finish(namespace, &job, attempt).await;

        let (status, message) = if failed {
            (ConditionStatus::False, Some(format!("build #{} failed", attempt)))
        } else {
            (ConditionStatus::True, None)
        };
        let finished = self
            .store
            .update_status(namespace, &job, |s| {
                // A newer attempt owns the conditions now.
                if s.latest_build == Some(attempt) {
                    s.set_condition(ready, status, message);
                }
            })
            .await;
        match finished {
            Ok(_) => info!(job = %job, attempt, ready = %status, "Build finished"),
            Err(e) => warn!(job = %job, error = %e, "Could not record build result"),
        }
    }
}
