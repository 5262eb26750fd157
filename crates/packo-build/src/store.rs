//! Resource store capability and the create-or-update step.

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;
use tracing::{debug, warn};

use packo_core::{BuildRecord, BuildRequest, ChangeEvent, JobName, WatchFilter};

use crate::error::StoreError;

/// Live feed of change events for one subscription.
///
/// Dropping the feed ends the subscription.
pub type ChangeFeed = Pin<Box<dyn Stream<Item = Result<ChangeEvent, StoreError>> + Send>>;

/// Storage for build records.
///
/// Implementations talk to whatever holds the desired state of builds (a
/// cluster API server in production, [`crate::memory::MemoryStore`] in tests).
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Point lookup. `Ok(None)` when no record has that name.
    async fn get(&self, namespace: &str, name: &JobName) -> Result<Option<BuildRecord>, StoreError>;

    /// Store a new record, assigning its identity metadata.
    async fn create(&self, record: BuildRecord) -> Result<BuildRecord, StoreError>;

    /// Replace an existing record. The record's resource version must match
    /// the stored one.
    async fn update(&self, record: BuildRecord) -> Result<BuildRecord, StoreError>;

    /// Subscribe to changes of the records matching `filter`.
    ///
    /// A record that already exists is delivered first as an `Added` event,
    /// so a subscriber cannot miss a state reached before it subscribed.
    async fn subscribe(&self, filter: WatchFilter) -> Result<ChangeFeed, StoreError>;
}

/// What an upsert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upserted {
    /// No record existed; one was created.
    Created(BuildRecord),
    /// The existing record's spec was replaced with a different one.
    Updated(BuildRecord),
    /// The existing record was rewritten with an identical spec.
    Unchanged(BuildRecord),
}

impl Upserted {
    /// The post-write record.
    pub fn record(&self) -> &BuildRecord {
        match self {
            Self::Created(r) | Self::Updated(r) | Self::Unchanged(r) => r,
        }
    }

    /// Returns true if the write should start a new build attempt.
    pub fn triggers_build(&self) -> bool {
        !matches!(self, Self::Unchanged(_))
    }

    /// Consume and return the post-write record.
    pub fn into_record(self) -> BuildRecord {
        match self {
            Self::Created(r) | Self::Updated(r) | Self::Unchanged(r) => r,
        }
    }
}

/// Create the request's record, or replace the spec of the existing one.
///
/// Updates keep the stored identity metadata. A record deleted between the
/// read and the write is recreated. Rewriting an identical spec is reported
/// as [`Upserted::Unchanged`].
pub async fn upsert(store: &dyn ResourceStore, request: BuildRequest) -> Result<Upserted, StoreError> {
    let existing = store.get(&request.namespace, &request.name).await?;

    let Some(current) = existing else {
        debug!(job = %request.name, namespace = %request.namespace, "Creating build request");
        return store
            .create(BuildRecord::from_request(request))
            .await
            .map(Upserted::Created);
    };

    debug!(
        job = %request.name,
        namespace = %request.namespace,
        resource_version = current.meta.resource_version,
        "Updating build request"
    );
    let changed = current.spec != request;
    match store.update(current.with_spec(request.clone())).await {
        Ok(record) if changed => Ok(Upserted::Updated(record)),
        Ok(record) => Ok(Upserted::Unchanged(record)),
        Err(e) if e.is_not_found() => {
            warn!(job = %request.name, "Build request vanished before update, creating it");
            store
                .create(BuildRecord::from_request(request))
                .await
                .map(Upserted::Created)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use packo_core::{BuilderRef, SourceRef};

    fn request(name: &str) -> BuildRequest {
        BuildRequest::for_go_command(
            JobName::new(name),
            "default",
            "registry.local",
            SourceRef::new("registry.local/source@sha256:00"),
            BuilderRef::cluster_builder("default-builder"),
        )
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let store = MemoryStore::new();

        let first = upsert(&store, request("controller")).await.unwrap();
        assert!(matches!(first, Upserted::Created(_)));

        let second = upsert(&store, request("controller")).await.unwrap();
        assert!(matches!(second, Upserted::Unchanged(_)));
        assert!(!second.triggers_build());

        let third = upsert(&store, request("controller").with_cache_size("4Gi"))
            .await
            .unwrap();
        assert!(matches!(third, Upserted::Updated(_)));
        assert!(third.triggers_build());

        let name = JobName::new("controller");
        assert_eq!(store.create_count(&name).await, 1);
        assert_eq!(store.update_count(&name).await, 2);
    }

    #[tokio::test]
    async fn test_identical_upsert_keeps_identity() {
        let store = MemoryStore::new();

        let created = upsert(&store, request("rebase")).await.unwrap().into_record();
        let updated = upsert(&store, request("rebase")).await.unwrap().into_record();

        assert!(created.meta.uid.is_some());
        assert_eq!(created.meta.uid, updated.meta.uid);
        assert_eq!(created.meta.created_at, updated.meta.created_at);
        assert_eq!(updated.spec, created.spec);
    }

    #[tokio::test]
    async fn test_upsert_replaces_spec() {
        let store = MemoryStore::new();
        upsert(&store, request("webhook")).await.unwrap();

        let changed = request("webhook").with_cache_size("4Gi");
        let updated = upsert(&store, changed).await.unwrap().into_record();
        assert_eq!(updated.spec.cache_size.as_deref(), Some("4Gi"));

        let stored = store
            .get("default", &JobName::new("webhook"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn test_upsert_recreates_after_delete_race() {
        let store = MemoryStore::new();
        upsert(&store, request("completion")).await.unwrap();
        store.delete_on_next_update(&JobName::new("completion")).await;

        let result = upsert(&store, request("completion")).await.unwrap();
        assert!(matches!(result, Upserted::Created(_)));
        assert_eq!(store.create_count(&JobName::new("completion")).await, 2);
    }

    #[tokio::test]
    async fn test_upsert_propagates_store_errors() {
        let store = MemoryStore::new();
        store.fail_upserts(&JobName::new("webhook"), "connection refused").await;

        let err = upsert(&store, request("webhook")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
