//! Change events delivered by a resource store subscription.

use crate::record::{BuildRecord, ObjectMeta};
use crate::JobName;
use serde::{Deserialize, Serialize};

/// A tagged snapshot of a build record.
///
/// Events for one resource arrive in order; nothing is promised across names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// The record was created, or was already present when the subscription opened.
    Added(BuildRecord),
    /// The record was written.
    Updated(BuildRecord),
    /// The record was removed.
    Deleted(BuildRecord),
}

impl ChangeEvent {
    /// The snapshot carried by this event.
    pub fn record(&self) -> &BuildRecord {
        match self {
            Self::Added(r) | Self::Updated(r) | Self::Deleted(r) => r,
        }
    }

    /// Consume and return the snapshot.
    pub fn into_record(self) -> BuildRecord {
        match self {
            Self::Added(r) | Self::Updated(r) | Self::Deleted(r) => r,
        }
    }

    /// Returns true for deletions.
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Deleted(_))
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Updated(_) => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Selects the events of one named resource in one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchFilter {
    /// Namespace to watch.
    pub namespace: String,
    /// Resource name to watch.
    pub name: JobName,
}

impl WatchFilter {
    /// Create a new filter.
    pub fn new(namespace: impl Into<String>, name: JobName) -> Self {
        Self {
            namespace: namespace.into(),
            name,
        }
    }

    /// Returns true if the metadata names the watched resource.
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        meta.namespace == self.namespace && meta.name == self.name
    }

    /// Returns true if the event concerns the watched resource.
    pub fn matches_event(&self, event: &ChangeEvent) -> bool {
        self.matches(&event.record().meta)
    }
}
