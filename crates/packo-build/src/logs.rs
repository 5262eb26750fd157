//! Build log streaming.
//!
//! A [`LogSource`] produces raw lines for one build attempt; [`stream_logs`]
//! copies them to a [`LineSink`] prefixed with the job name so the output of
//! concurrent builds stays readable when interleaved.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use packo_core::{AttemptSelector, JobName};

use crate::error::LogError;

/// Which build output to stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    /// Namespace of the build.
    pub namespace: String,
    /// Job whose output to stream.
    pub job: JobName,
    /// Which attempt of the job.
    pub attempt: AttemptSelector,
}

impl LogTarget {
    /// Create a new LogTarget.
    pub fn new(namespace: impl Into<String>, job: JobName, attempt: AttemptSelector) -> Self {
        Self {
            namespace: namespace.into(),
            job,
            attempt,
        }
    }
}

/// Source of live build output.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Send the target's output, one line at a time, until the output ends
    /// or `cancel` fires.
    ///
    /// Returns `Ok(())` when the output ended. A closed `lines` channel means
    /// the reader left and should end the stream with [`LogError::SinkClosed`].
    async fn tail(
        &self,
        target: &LogTarget,
        lines: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), LogError>;
}

/// Destination for build output lines.
#[async_trait]
pub trait LineSink: Send + Sync {
    /// Write one line under a prefix.
    async fn write_line(&self, prefix: &str, line: &str) -> io::Result<()>;
}

/// Writes `[prefix] line` to stdout.
///
/// Writes are serialized so lines of concurrent builds never interleave
/// mid-line, and go through tokio's stdout so a slow terminal does not stall
/// a runtime worker.
#[derive(Debug)]
pub struct StdoutSink {
    stdout: AsyncMutex<Stdout>,
}

impl StdoutSink {
    /// Create a new StdoutSink.
    pub fn new() -> Self {
        Self {
            stdout: AsyncMutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LineSink for StdoutSink {
    async fn write_line(&self, prefix: &str, line: &str) -> io::Result<()> {
        let formatted = format!("[{}] {}\n", prefix, line);
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(formatted.as_bytes()).await?;
        stdout.flush().await
    }
}

/// Keeps every written line in memory.
#[derive(Debug, Default)]
pub struct CaptureSink {
    lines: Mutex<Vec<String>>,
}

impl CaptureSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All lines written so far, formatted `[prefix] line`.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Lines written under `prefix`, without the prefix.
    pub fn lines_for(&self, prefix: &str) -> Vec<String> {
        let tag = format!("[{}] ", prefix);
        self.lines()
            .into_iter()
            .filter_map(|l| l.strip_prefix(&tag).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl LineSink for CaptureSink {
    async fn write_line(&self, prefix: &str, line: &str) -> io::Result<()> {
        let mut lines = self
            .lines
            .lock()
            .map_err(|_| io::Error::other("capture sink poisoned"))?;
        lines.push(format!("[{}] {}", prefix, line));
        Ok(())
    }
}

/// Copy the target's output to `sink` until it ends or `cancel` fires.
///
/// Cancellation is not an error. `capacity` bounds how many lines may be
/// buffered between the source and the sink.
pub async fn stream_logs(
    source: &dyn LogSource,
    target: LogTarget,
    sink: Arc<dyn LineSink>,
    capacity: usize,
    cancel: CancellationToken,
) -> Result<(), LogError> {
    let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
    let prefix = target.job.to_string();

    let tail = source.tail(&target, tx, cancel.clone());
    let drain = async {
        let mut written = 0u64;
        while let Some(line) = rx.recv().await {
            trace!(job = %prefix, "Log line");
            sink.write_line(&prefix, &line).await?;
            written += 1;
        }
        Ok::<u64, LogError>(written)
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(job = %target.job, "Log stream cancelled");
            Ok(())
        }
        (tailed, drained) = async { tokio::join!(tail, drain) } => {
            let written = drained?;
            tailed?;
            debug!(job = %target.job, attempt = %target.attempt, lines = written, "Log stream ended");
            Ok(())
        }
    }
}
