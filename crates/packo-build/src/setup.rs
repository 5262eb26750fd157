//! Cluster preparation before any build is triggered.

use async_trait::async_trait;
use tracing::info;

use packo_core::{ClusterBuilder, ClusterBuilderSpec};

use crate::error::{SetupError, StoreError};

/// Storage for cluster-scoped builders.
#[async_trait]
pub trait BuilderStore: Send + Sync {
    /// Point lookup. `Ok(None)` when no builder has that name.
    async fn get_builder(&self, name: &str) -> Result<Option<ClusterBuilder>, StoreError>;

    /// Store a new builder.
    async fn create_builder(&self, builder: ClusterBuilder) -> Result<ClusterBuilder, StoreError>;

    /// Replace an existing builder.
    async fn update_builder(&self, builder: ClusterBuilder) -> Result<ClusterBuilder, StoreError>;
}

/// Make sure a builder named `name` exists with `spec`.
///
/// Creates it when missing; otherwise replaces its spec, keeping its identity.
pub async fn ensure_builder(
    store: &dyn BuilderStore,
    name: &str,
    spec: ClusterBuilderSpec,
) -> Result<ClusterBuilder, SetupError> {
    let wrap = |source| SetupError::Builder {
        name: name.to_string(),
        source,
    };

    let builder = match store.get_builder(name).await.map_err(wrap)? {
        None => {
            let mut builder = ClusterBuilder::new(name, spec.image.clone());
            builder.spec = spec;
            store.create_builder(builder).await.map_err(wrap)?
        }
        Some(existing) => store
            .update_builder(existing.with_spec(spec))
            .await
            .map_err(wrap)?,
    };

    info!(
        builder = %builder.name,
        image = %builder.spec.image,
        resource_version = builder.resource_version,
        "Builder ready"
    );
    Ok(builder)
}
