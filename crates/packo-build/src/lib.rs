//! Concurrent build orchestration for packo
//!
//! This crate drives a group of container image builds against a resource
//! store: each job upserts its build request, follows the build's log output,
//! and waits for the build's `Ready` condition. The group runs every job
//! concurrently and cancels the rest as soon as one fails.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use packo_build::memory::{MemoryLogSource, MemoryStore, SimulatedController};
//! use packo_build::{run_group, BuildTask, GroupTask, StdoutSink};
//! use packo_core::{BuildRequest, BuilderRef, JobName, SourceRef};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn build_all() {
//!     let store = Arc::new(MemoryStore::new());
//!     let logs = Arc::new(MemoryLogSource::new());
//!     let cancel = CancellationToken::new();
//!     SimulatedController::new(store.clone(), logs.clone()).spawn(cancel.clone());
//!     let sink = Arc::new(StdoutSink::new());
//!
//!     let tasks: Vec<Arc<dyn GroupTask>> = ["controller", "webhook"]
//!         .into_iter()
//!         .map(|name| {
//!             let request = BuildRequest::for_go_command(
//!                 JobName::new(name),
//!                 "default",
//!                 "registry.local",
//!                 SourceRef::new("registry.local/source@sha256:00"),
//!                 BuilderRef::cluster_builder("default-builder"),
//!             );
//!             Arc::new(BuildTask::new(request, store.clone(), logs.clone(), sink.clone()))
//!                 as Arc<dyn GroupTask>
//!         })
//!         .collect();
//!
//!     let report = run_group(&cancel, tasks).await;
//!     println!("{} of {} succeeded", report.succeeded(), report.results.len());
//! }
//! ```

mod error;
mod group;
mod logs;
pub mod memory;
mod setup;
mod store;
mod task;
mod upload;
mod watcher;

// Re-export main types
pub use error::{BuildError, LogError, SetupError, StoreError, UploadError};
pub use group::{run_group, FnTask, GroupOutcome, GroupReport, GroupTask, TaskResult};
pub use logs::{stream_logs, CaptureSink, LineSink, LogSource, LogTarget, StdoutSink};
pub use setup::{ensure_builder, BuilderStore};
pub use store::{upsert, ChangeFeed, ResourceStore, Upserted};
pub use task::{BuildTask, TaskSettings};
pub use upload::{ArtifactUploader, DigestUploader};
pub use watcher::{AbortReason, ConditionWatcher, WatchOutcome, WatchState};
