//! In-memory build log source.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use packo_core::{AttemptSelector, JobName};

use crate::error::LogError;
use crate::logs::{LogSource, LogTarget};

#[derive(Default)]
struct Buffer {
    lines: Vec<String>,
    finished: bool,
}

type Key = (String, JobName);

/// Append-only line buffers per build attempt.
#[derive(Default)]
pub struct MemoryLogSource {
    buffers: Mutex<HashMap<Key, BTreeMap<u64, Buffer>>>,
    faults: Mutex<HashMap<JobName, String>>,
    changed: Notify,
}

impl MemoryLogSource {
    /// Create an empty log source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line to an attempt's output, creating the attempt if needed.
    pub async fn append(&self, namespace: &str, job: &JobName, attempt: u64, line: impl Into<String>) {
        {
            let mut buffers = self.buffers.lock().await;
            buffers
                .entry((namespace.to_string(), job.clone()))
                .or_default()
                .entry(attempt)
                .or_default()
                .lines
                .push(line.into());
        }
        self.changed.notify_waiters();
    }

    /// Mark an attempt's output as complete.
    pub async fn finish(&self, namespace: &str, job: &JobName, attempt: u64) {
        {
            let mut buffers = self.buffers.lock().await;
            buffers
                .entry((namespace.to_string(), job.clone()))
                .or_default()
                .entry(attempt)
                .or_default()
                .finished = true;
        }
        self.changed.notify_waiters();
    }

    /// Everything written for an attempt so far.
    pub async fn lines(&self, namespace: &str, job: &JobName, attempt: u64) -> Vec<String> {
        self.buffers
            .lock()
            .await
            .get(&(namespace.to_string(), job.clone()))
            .and_then(|attempts| attempts.get(&attempt))
            .map(|b| b.lines.clone())
            .unwrap_or_default()
    }

    /// Make every tail of `job` fail immediately.
    pub async fn fail_tail(&self, job: &JobName, message: impl Into<String>) {
        self.faults.lock().await.insert(job.clone(), message.into());
    }

    /// Lines after `from` of the selected attempt, and whether it is finished.
    ///
    /// `resolved` pins `Latest` to the first attempt found.
    async fn read_from(
        &self,
        target: &LogTarget,
        resolved: &mut Option<u64>,
        from: usize,
    ) -> (Vec<String>, bool) {
        let buffers = self.buffers.lock().await;
        let Some(attempts) = buffers.get(&(target.namespace.clone(), target.job.clone())) else {
            return (Vec::new(), false);
        };

        if resolved.is_none() {
            *resolved = match target.attempt {
                AttemptSelector::Latest => attempts.keys().next_back().copied(),
                AttemptSelector::Build(n) => attempts.contains_key(&n).then_some(n),
            };
        }

        match resolved.and_then(|n| attempts.get(&n)) {
            Some(buffer) => (
                buffer.lines.get(from..).map(<[String]>::to_vec).unwrap_or_default(),
                buffer.finished,
            ),
            None => (Vec::new(), false),
        }
    }
}

#[async_trait]
impl LogSource for MemoryLogSource {
    async fn tail(
        &self,
        target: &LogTarget,
        lines: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), LogError> {
        if let Some(message) = self.faults.lock().await.get(&target.job) {
            return Err(LogError::Interrupted(message.clone()));
        }

        let mut resolved = None;
        let mut next = 0;
        loop {
            // Register interest before reading so a concurrent append is not missed.
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let (chunk, finished) = self.read_from(target, &mut resolved, next).await;
            for line in chunk {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = lines.send(line) => sent.map_err(|_| LogError::SinkClosed)?,
                }
                next += 1;
            }
            if finished {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = &mut changed => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn target(attempt: AttemptSelector) -> LogTarget {
        LogTarget::new("default", JobName::new("controller"), attempt)
    }

    #[tokio::test]
    async fn test_tail_follows_until_finished() {
        let source = Arc::new(MemoryLogSource::new());
        let job = JobName::new("controller");
        let (tx, mut rx) = mpsc::channel(16);

        let tail = {
            let source = source.clone();
            tokio::spawn(async move {
                source
                    .tail(&target(AttemptSelector::Build(1)), tx, CancellationToken::new())
                    .await
            })
        };

        source.append("default", &job, 1, "===> DETECTING").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.append("default", &job, 1, "===> BUILDING").await;
        source.finish("default", &job, 1).await;

        tail.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("===> DETECTING"));
        assert_eq!(rx.recv().await.as_deref(), Some("===> BUILDING"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_latest_picks_highest_attempt() {
        let source = MemoryLogSource::new();
        let job = JobName::new("controller");
        source.append("default", &job, 1, "old").await;
        source.finish("default", &job, 1).await;
        source.append("default", &job, 2, "new").await;
        source.finish("default", &job, 2).await;

        let (tx, mut rx) = mpsc::channel(16);
        source
            .tail(&target(AttemptSelector::Latest), tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("new"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_tail_returns_on_cancel() {
        let source = MemoryLogSource::new();
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = source
            .tail(&target(AttemptSelector::Build(5)), tx, cancel)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_fault_interrupts_tail() {
        let source = MemoryLogSource::new();
        source.fail_tail(&JobName::new("controller"), "evicted").await;
        let (tx, _rx) = mpsc::channel(16);

        let err = source
            .tail(&target(AttemptSelector::Latest), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Interrupted(_)));
    }
}
