//! Cluster-scoped builder resource.

use crate::Uid;
use serde::{Deserialize, Serialize};

/// How the controller keeps the builder image current.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// Poll the builder image for new versions.
    #[default]
    Polling,
    /// Only change on explicit update.
    External,
}

/// Desired state of a cluster builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBuilderSpec {
    /// Builder image reference.
    pub image: String,
    /// Update policy.
    pub update_policy: UpdatePolicy,
}

/// A cluster-scoped builder that build requests reference by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBuilder {
    /// Builder name.
    pub name: String,
    /// Object identity, assigned by the store on create.
    pub uid: Option<Uid>,
    /// Optimistic concurrency token.
    pub resource_version: u64,
    /// Desired state.
    pub spec: ClusterBuilderSpec,
}

impl ClusterBuilder {
    /// A not-yet-stored builder.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            resource_version: 0,
            spec: ClusterBuilderSpec {
                image: image.into(),
                update_policy: UpdatePolicy::Polling,
            },
        }
    }

    /// Replace the spec, keeping identity metadata.
    pub fn with_spec(&self, spec: ClusterBuilderSpec) -> Self {
        Self {
            name: self.name.clone(),
            uid: self.uid.clone(),
            resource_version: self.resource_version,
            spec,
        }
    }
}
