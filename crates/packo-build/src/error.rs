//! Error types for build orchestration.

use std::path::PathBuf;

use packo_core::{CoreError, JobName};
use thiserror::Error;

/// Errors returned by a resource store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No resource with that name.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// A resource with that name already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// The write carried a stale resource version.
    #[error("{kind} '{name}' was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        kind: &'static str,
        name: String,
        expected: u64,
        found: u64,
    },

    /// The store could not be reached.
    #[error("Resource store unavailable: {0}")]
    Unavailable(String),

    /// A change subscription could not be opened or was dropped.
    #[error("Watch failed: {0}")]
    Watch(String),
}

impl StoreError {
    /// Returns true for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors from streaming build logs. Never fatal to a build task.
#[derive(Debug, Error)]
pub enum LogError {
    /// No log stream exists for the requested attempt.
    #[error("No logs for {job} attempt {attempt}")]
    NotFound { job: JobName, attempt: String },

    /// The stream broke before the build finished.
    #[error("Log stream interrupted: {0}")]
    Interrupted(String),

    /// Nothing is reading the lines any more.
    #[error("Log sink closed")]
    SinkClosed,

    /// Writing to the sink failed.
    #[error("Failed to write log line: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from packaging and publishing source.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Source path missing or not a directory.
    #[error("Source path '{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// Reading the source tree failed.
    #[error("Failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry reference cannot name a repository.
    #[error("Invalid registry '{0}'")]
    InvalidRegistry(String),

    /// The blocking hashing task died.
    #[error("Upload task failed: {0}")]
    Join(String),
}

/// Errors from preparing the cluster before any build is triggered.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Reading or writing the builder failed.
    #[error("Failed to set up builder '{name}': {source}")]
    Builder {
        name: String,
        #[source]
        source: StoreError,
    },
}

/// Why a single build task failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// The request was rejected before reaching the store.
    #[error("{job}: invalid request: {source}")]
    Invalid {
        job: JobName,
        #[source]
        source: CoreError,
    },

    /// Creating or updating the request failed.
    #[error("{job} upsert failed: {source}")]
    Upsert {
        job: JobName,
        #[source]
        source: StoreError,
    },

    /// The readiness subscription could not be opened.
    #[error("{job}: could not watch build status: {source}")]
    Subscribe {
        job: JobName,
        #[source]
        source: StoreError,
    },

    /// The readiness subscription ended before the build became ready.
    #[error("{job}: watch ended before build became ready: {reason}")]
    WatchClosed { job: JobName, reason: String },

    /// Another task failed first and the group cancelled this one.
    #[error("{job}: cancelled by sibling failure")]
    Cancelled { job: JobName },

    /// The whole group was cancelled from outside, e.g. by a deadline or Ctrl-C.
    #[error("{job}: cancelled")]
    Interrupted { job: JobName },

    /// The task panicked.
    #[error("{job}: task panicked: {message}")]
    Panicked { job: JobName, message: String },
}

impl BuildError {
    /// The job this error belongs to.
    pub fn job(&self) -> &JobName {
        match self {
            Self::Invalid { job, .. }
            | Self::Upsert { job, .. }
            | Self::Subscribe { job, .. }
            | Self::WatchClosed { job, .. }
            | Self::Cancelled { job }
            | Self::Interrupted { job }
            | Self::Panicked { job, .. } => job,
        }
    }

    /// Returns true if the task stopped because of cancellation rather than a local fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Interrupted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_message_names_job() {
        let err = BuildError::Upsert {
            job: JobName::new("webhook"),
            source: StoreError::Unavailable("connection refused".to_string()),
        };
        assert!(err.to_string().starts_with("webhook upsert failed"));
        assert_eq!(err.job().as_str(), "webhook");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_cancelled_is_distinguished() {
        let err = BuildError::Cancelled {
            job: JobName::new("rebase"),
        };
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "rebase: cancelled by sibling failure");

        let err = BuildError::Interrupted {
            job: JobName::new("rebase"),
        };
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "rebase: cancelled");
    }
}
