//! Desired state of one build job.

use crate::{CoreError, JobName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Build environment variable selecting the Go main package to build.
pub const GO_TARGETS_ENV: &str = "BP_GO_TARGETS";

/// Content-addressed pointer to uploaded source, e.g. `registry/source@sha256:...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRef(String);

impl SourceRef {
    /// Create a new SourceRef without validation.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Build a digest reference from a repository and a hex-encoded sha256.
    pub fn from_digest(repository: &str, sha256_hex: &str) -> Self {
        Self(format!("{}@sha256:{}", repository, sha256_hex))
    }

    /// The digest part after `@`, if this is a digest reference.
    pub fn digest(&self) -> Option<&str> {
        self.0.split_once('@').map(|(_, digest)| digest)
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to the builder that turns source into an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuilderRef {
    /// Resource kind, e.g. `ClusterBuilder`.
    pub kind: String,
    /// Builder resource name.
    pub name: String,
}

impl BuilderRef {
    /// Kind of cluster-scoped builders.
    pub const CLUSTER_BUILDER: &'static str = "ClusterBuilder";

    /// Reference a cluster-scoped builder by name.
    pub fn cluster_builder(name: impl Into<String>) -> Self {
        Self {
            kind: Self::CLUSTER_BUILDER.to_string(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BuilderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Request to build one job. Created or replaced idempotently by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Job name, unique within the namespace.
    pub name: JobName,

    /// Namespace the request lives in.
    pub namespace: String,

    /// Target image reference.
    pub tag: String,

    /// Uploaded source to build from.
    pub source: SourceRef,

    /// Builder to build with.
    pub builder: BuilderRef,

    /// Size of the build cache volume, e.g. `2Gi`.
    pub cache_size: Option<String>,

    /// Build environment.
    pub env: BTreeMap<String, String>,
}

impl BuildRequest {
    /// Create a new BuildRequest.
    pub fn new(
        name: JobName,
        namespace: impl Into<String>,
        tag: impl Into<String>,
        source: SourceRef,
        builder: BuilderRef,
    ) -> Self {
        Self {
            name,
            namespace: namespace.into(),
            tag: tag.into(),
            source,
            builder,
            cache_size: None,
            env: BTreeMap::new(),
        }
    }

    /// Request for a Go service living under `./cmd/<name>`, tagged `<registry>/<name>`.
    pub fn for_go_command(
        name: JobName,
        namespace: impl Into<String>,
        registry: &str,
        source: SourceRef,
        builder: BuilderRef,
    ) -> Self {
        let tag = format!("{}/{}", registry.trim_end_matches('/'), name);
        let target = format!("./cmd/{}", name);
        Self::new(name, namespace, tag, source, builder).with_env(GO_TARGETS_ENV, target)
    }

    /// Builder method to set the cache size.
    pub fn with_cache_size(mut self, size: impl Into<String>) -> Self {
        self.cache_size = Some(size.into());
        self
    }

    /// Builder method to add a build environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Check the request is well formed before it is sent to the store.
    pub fn validate(&self) -> Result<(), CoreError> {
        JobName::parse(self.name.as_str())?;
        if self.namespace.is_empty() {
            return Err(CoreError::InvalidInput("namespace must not be empty".to_string()));
        }
        if self.tag.is_empty() || self.tag.starts_with('/') {
            return Err(CoreError::InvalidReference(self.tag.clone()));
        }
        if self.source.as_str().is_empty() {
            return Err(CoreError::InvalidReference(self.source.to_string()));
        }
        if self.builder.name.is_empty() {
            return Err(CoreError::InvalidReference(self.builder.to_string()));
        }
        Ok(())
    }
}
