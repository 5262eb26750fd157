//! Packo Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - An async runtime
//! - A cluster client
//! - A registry client
//!
//! All types here describe build requests as they are desired and build
//! records as they are observed from the resource store.

pub mod builder;
pub mod error;
pub mod event;
pub mod ids;
pub mod record;
pub mod request;
pub mod status;

// Re-export commonly used types
pub use builder::{ClusterBuilder, ClusterBuilderSpec, UpdatePolicy};
pub use error::CoreError;
pub use event::{ChangeEvent, WatchFilter};
pub use ids::{JobName, Uid};
pub use record::{BuildRecord, BuildStatus, Condition, ObjectMeta};
pub use request::{BuildRequest, BuilderRef, SourceRef};
pub use status::{AttemptSelector, ConditionStatus, ConditionType};
