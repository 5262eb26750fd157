//! In-memory resource store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

use packo_core::{BuildRecord, BuildStatus, ChangeEvent, ClusterBuilder, JobName, Uid, WatchFilter};

use crate::error::StoreError;
use crate::setup::BuilderStore;
use crate::store::{ChangeFeed, ResourceStore};

const BUILD_KIND: &str = "Build request";
const BUILDER_KIND: &str = "ClusterBuilder";

/// Change events buffered per subscriber before it counts as lagging.
const DEFAULT_EVENT_BUFFER: usize = 1024;

type Key = (String, JobName);

#[derive(Default)]
struct State {
    records: HashMap<Key, BuildRecord>,
    builders: HashMap<String, ClusterBuilder>,
    /// Last issued resource version, shared by all kinds.
    version: u64,
    creates: HashMap<JobName, usize>,
    updates: HashMap<JobName, usize>,
    upsert_faults: HashMap<JobName, String>,
    subscribe_faults: HashSet<JobName>,
    delete_on_update: HashSet<JobName>,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Build records and builders held in memory, with a change broadcast.
///
/// Writes publish their event while holding the state lock, so events for
/// one record are delivered in write order.
pub struct MemoryStore {
    state: RwLock<State>,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_event_buffer(DEFAULT_EVENT_BUFFER)
    }

    /// Create an empty store whose subscribers may fall `capacity` events behind.
    pub fn with_event_buffer(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(State::default()),
            events,
        }
    }

    /// Unfiltered feed of every change, for controllers.
    pub fn events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Number of open subscriptions, controllers included.
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// How many times a record with this name was created.
    pub async fn create_count(&self, name: &JobName) -> usize {
        self.state.read().await.creates.get(name).copied().unwrap_or(0)
    }

    /// How many times a record with this name had its spec replaced.
    pub async fn update_count(&self, name: &JobName) -> usize {
        self.state.read().await.updates.get(name).copied().unwrap_or(0)
    }

    /// Make every read and write of `name` fail as if the store were unreachable.
    pub async fn fail_upserts(&self, name: &JobName, message: impl Into<String>) {
        self.state
            .write()
            .await
            .upsert_faults
            .insert(name.clone(), message.into());
    }

    /// Refuse subscriptions for `name`.
    pub async fn fail_subscriptions(&self, name: &JobName) {
        self.state.write().await.subscribe_faults.insert(name.clone());
    }

    /// Delete `name` right before its next update, as a concurrent client would.
    pub async fn delete_on_next_update(&self, name: &JobName) {
        self.state.write().await.delete_on_update.insert(name.clone());
    }

    /// Write a record's status, as the build controller does.
    ///
    /// Does not count as an update of the request.
    pub async fn update_status(
        &self,
        namespace: &str,
        name: &JobName,
        f: impl FnOnce(&mut BuildStatus) + Send,
    ) -> Result<BuildRecord, StoreError> {
        let mut state = self.state.write().await;
        let State {
            records, version, ..
        } = &mut *state;
        let record = records
            .get_mut(&(namespace.to_string(), name.clone()))
            .ok_or_else(|| not_found(BUILD_KIND, name.as_str()))?;

        f(&mut record.status);
        *version += 1;
        record.meta.resource_version = *version;
        let snapshot = record.clone();
        self.publish(ChangeEvent::Updated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Remove a record.
    pub async fn delete(&self, namespace: &str, name: &JobName) -> Result<BuildRecord, StoreError> {
        let mut state = self.state.write().await;
        let removed = state
            .records
            .remove(&(namespace.to_string(), name.clone()))
            .ok_or_else(|| not_found(BUILD_KIND, name.as_str()))?;
        self.publish(ChangeEvent::Deleted(removed.clone()));
        Ok(removed)
    }

    fn publish(&self, event: ChangeEvent) {
        debug!(job = %event.record().name(), event = event.kind(), "Publishing change");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn check_fault(state: &State, name: &JobName) -> Result<(), StoreError> {
        match state.upsert_faults.get(name) {
            Some(message) => Err(StoreError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(kind: &'static str, name: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        name: name.to_string(),
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, namespace: &str, name: &JobName) -> Result<Option<BuildRecord>, StoreError> {
        let state = self.state.read().await;
        Self::check_fault(&state, name)?;
        Ok(state
            .records
            .get(&(namespace.to_string(), name.clone()))
            .cloned())
    }

    async fn create(&self, mut record: BuildRecord) -> Result<BuildRecord, StoreError> {
        let mut state = self.state.write().await;
        Self::check_fault(&state, &record.meta.name)?;

        let key = (record.meta.namespace.clone(), record.meta.name.clone());
        if state.records.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: BUILD_KIND,
                name: record.meta.name.to_string(),
            });
        }

        record.meta.uid = Some(Uid::generate());
        record.meta.created_at = Some(Utc::now());
        record.meta.resource_version = state.next_version();
        record.status = BuildStatus::default();

        *state.creates.entry(record.meta.name.clone()).or_default() += 1;
        state.records.insert(key, record.clone());
        self.publish(ChangeEvent::Added(record.clone()));
        Ok(record)
    }

    async fn update(&self, mut record: BuildRecord) -> Result<BuildRecord, StoreError> {
        let mut state = self.state.write().await;
        Self::check_fault(&state, &record.meta.name)?;

        let key = (record.meta.namespace.clone(), record.meta.name.clone());
        if state.delete_on_update.remove(&record.meta.name) {
            if let Some(removed) = state.records.remove(&key) {
                self.publish(ChangeEvent::Deleted(removed));
            }
        }

        let stored = state
            .records
            .get(&key)
            .ok_or_else(|| not_found(BUILD_KIND, record.meta.name.as_str()))?;
        if stored.meta.resource_version != record.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: BUILD_KIND,
                name: record.meta.name.to_string(),
                expected: record.meta.resource_version,
                found: stored.meta.resource_version,
            });
        }

        // Identity and status belong to the store and the controller.
        record.meta.uid = stored.meta.uid.clone();
        record.meta.created_at = stored.meta.created_at;
        record.status = stored.status.clone();
        record.meta.resource_version = state.next_version();

        *state.updates.entry(record.meta.name.clone()).or_default() += 1;
        state.records.insert(key, record.clone());
        self.publish(ChangeEvent::Updated(record.clone()));
        Ok(record)
    }

    async fn subscribe(&self, filter: WatchFilter) -> Result<ChangeFeed, StoreError> {
        // Holding the read lock keeps writers out between subscribing and
        // taking the snapshot, so nothing is missed or replayed twice.
        let state = self.state.read().await;
        if state.subscribe_faults.contains(&filter.name) {
            return Err(StoreError::Watch(format!("watch on '{}' refused", filter.name)));
        }

        let rx = self.events.subscribe();
        let existing = state
            .records
            .get(&(filter.namespace.clone(), filter.name.clone()))
            .cloned();
        drop(state);

        let replay = tokio_stream::iter(existing.map(|r| Ok(ChangeEvent::Added(r))));
        let live = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(event) if filter.matches_event(&event) => Some(Ok(event)),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(StoreError::Watch(format!(
                "subscription fell behind by {} events",
                n
            )))),
        });

        Ok(Box::pin(replay.chain(live)))
    }
}

#[async_trait]
impl BuilderStore for MemoryStore {
    async fn get_builder(&self, name: &str) -> Result<Option<ClusterBuilder>, StoreError> {
        Ok(self.state.read().await.builders.get(name).cloned())
    }

    async fn create_builder(&self, mut builder: ClusterBuilder) -> Result<ClusterBuilder, StoreError> {
        let mut state = self.state.write().await;
        if state.builders.contains_key(&builder.name) {
            return Err(StoreError::AlreadyExists {
                kind: BUILDER_KIND,
                name: builder.name,
            });
        }
        builder.uid = Some(Uid::generate());
        builder.resource_version = state.next_version();
        state.builders.insert(builder.name.clone(), builder.clone());
        Ok(builder)
    }

    async fn update_builder(&self, mut builder: ClusterBuilder) -> Result<ClusterBuilder, StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .builders
            .get(&builder.name)
            .ok_or_else(|| not_found(BUILDER_KIND, &builder.name))?;
        if stored.resource_version != builder.resource_version {
            return Err(StoreError::Conflict {
                kind: BUILDER_KIND,
                name: builder.name.clone(),
                expected: builder.resource_version,
                found: stored.resource_version,
            });
        }
        builder.uid = stored.uid.clone();
        builder.resource_version = state.next_version();
        state.builders.insert(builder.name.clone(), builder.clone());
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packo_core::{BuildRequest, BuilderRef, ConditionStatus, ConditionType, SourceRef};

    fn record(name: &str) -> BuildRecord {
        BuildRecord::from_request(BuildRequest::for_go_command(
            JobName::new(name),
            "default",
            "registry.local",
            SourceRef::new("registry.local/source@sha256:00"),
            BuilderRef::cluster_builder("default-builder"),
        ))
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = MemoryStore::new();
        let created = store.create(record("controller")).await.unwrap();

        assert!(created.meta.uid.is_some());
        assert!(created.meta.created_at.is_some());
        assert!(created.meta.resource_version > 0);
        assert!(matches!(
            store.create(record("controller")).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(record("rebase")).await.unwrap();
        store.update(created.clone()).await.unwrap();

        assert!(matches!(
            store.update(created).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_keeps_controller_status() {
        let store = MemoryStore::new();
        let name = JobName::new("webhook");
        let created = store.create(record("webhook")).await.unwrap();
        store
            .update_status("default", &name, |s| {
                s.latest_build = Some(1);
                s.set_condition(ConditionType::ready(), ConditionStatus::True, None);
            })
            .await
            .unwrap();

        let current = store.get("default", &name).await.unwrap().unwrap();
        let mut stale_status = current.clone();
        stale_status.status = BuildStatus::default();
        let updated = store.update(stale_status).await.unwrap();

        assert_eq!(updated.status.latest_build, Some(1));
        assert!(updated.is_ready());
        assert_eq!(updated.meta.uid, created.meta.uid);
        assert_eq!(store.update_count(&name).await, 1);
    }

    #[tokio::test]
    async fn test_status_write_to_missing_record_keeps_version() {
        let store = MemoryStore::new();
        let err = store
            .update_status("default", &JobName::new("rebase"), |s| s.latest_build = Some(1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let created = store.create(record("rebase")).await.unwrap();
        assert_eq!(created.meta.resource_version, 1);
    }

    #[tokio::test]
    async fn test_subscribe_replays_existing_then_follows() {
        let store = MemoryStore::new();
        let name = JobName::new("completion");
        store.create(record("completion")).await.unwrap();
        store.create(record("controller")).await.unwrap();

        let mut feed = store
            .subscribe(WatchFilter::new("default", name.clone()))
            .await
            .unwrap();
        assert_eq!(store.watcher_count(), 1);

        let first = feed.next().await.unwrap().unwrap();
        assert!(matches!(first, ChangeEvent::Added(_)));

        // Events for other names are filtered out.
        store
            .update_status("default", &JobName::new("controller"), |s| s.latest_build = Some(9))
            .await
            .unwrap();
        store
            .update_status("default", &name, |s| s.latest_build = Some(1))
            .await
            .unwrap();
        store.delete("default", &name).await.unwrap();

        let second = feed.next().await.unwrap().unwrap();
        assert_eq!(second.record().status.latest_build, Some(1));
        assert!(feed.next().await.unwrap().unwrap().is_delete());

        drop(feed);
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_error() {
        let store = MemoryStore::with_event_buffer(1);
        let name = JobName::new("rebase");
        store.create(record("rebase")).await.unwrap();
        let mut feed = store
            .subscribe(WatchFilter::new("default", name.clone()))
            .await
            .unwrap();
        feed.next().await.unwrap().unwrap();

        for build in 1..=3 {
            store
                .update_status("default", &name, |s| s.latest_build = Some(build))
                .await
                .unwrap();
        }

        assert!(matches!(feed.next().await, Some(Err(StoreError::Watch(_)))));
    }

    #[tokio::test]
    async fn test_builder_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get_builder("default-builder").await.unwrap().is_none());

        let created = store
            .create_builder(ClusterBuilder::new("default-builder", "cloudfoundry/cnb:bionic"))
            .await
            .unwrap();
        let updated = store.update_builder(created.clone()).await.unwrap();

        assert_eq!(created.uid, updated.uid);
        assert!(updated.resource_version > created.resource_version);
    }
}
