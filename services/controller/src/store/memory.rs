//! In-memory store.
//!
//! Backs the binary when no external store is configured and drives every
//! test. Behaves like a small API server: it assigns UIDs, resource versions
//! and creation timestamps, rejects stale writes, cascades deletes to
//! controlled children and streams changes to watchers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cadence_api::{CronSchedule, Kind, Object, WatchEvent, WorkItem};
use cadence_id::{ObjectKey, Uid};
use cadence_reconcile::{Clock, SystemClock};
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::{Propagation, Snapshot, Store, StoreError, StoreResult};

/// Watch events retained for resuming watchers.
const HISTORY_LIMIT: usize = 1024;

/// Live watch buffer; a watcher that falls further behind is cut off.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

type StoreKey = (Kind, ObjectKey);

struct State {
    objects: BTreeMap<StoreKey, Object>,
    version: u64,
    history: VecDeque<WatchEvent>,
}

#[derive(Default)]
struct Faults {
    next_create: Option<StoreError>,
    next_status_update: Option<StoreError>,
    deletes: Option<StoreError>,
}

#[derive(Default)]
struct CallCounts {
    creates: AtomicUsize,
    deletes: AtomicUsize,
    status_updates: AtomicUsize,
}

/// A [`Store`] held entirely in memory.
pub struct MemoryStore {
    state: RwLock<State>,
    events: broadcast::Sender<WatchEvent>,
    clock: Arc<dyn Clock>,
    faults: Mutex<Faults>,
    calls: CallCounts,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    /// Creates an empty store stamping creation times from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(State {
                objects: BTreeMap::new(),
                version: 0,
                history: VecDeque::new(),
            }),
            events,
            clock,
            faults: Mutex::new(Faults::default()),
            calls: CallCounts::default(),
        }
    }

    /// The next `create_work_item` call fails with `err`.
    pub fn fail_next_create(&self, err: StoreError) {
        self.faults.lock().next_create = Some(err);
    }

    /// The next status update (of any kind) fails with `err`.
    pub fn fail_next_status_update(&self, err: StoreError) {
        self.faults.lock().next_status_update = Some(err);
    }

    /// Every `delete_work_item` call fails with `err` until cleared with `None`.
    pub fn fail_deletes(&self, err: Option<StoreError>) {
        self.faults.lock().deletes = err;
    }

    /// Number of `create_work_item` calls, including failed ones.
    pub fn create_calls(&self) -> usize {
        self.calls.creates.load(Ordering::SeqCst)
    }

    /// Number of `delete_work_item` calls, including failed ones.
    pub fn delete_calls(&self) -> usize {
        self.calls.deletes.load(Ordering::SeqCst)
    }

    /// Number of status update calls, including failed ones.
    pub fn status_update_calls(&self) -> usize {
        self.calls.status_updates.load(Ordering::SeqCst)
    }

    /// Every stored work item, in key order.
    pub async fn work_items(&self) -> Vec<WorkItem> {
        let state = self.state.read().await;
        state
            .objects
            .values()
            .filter_map(|o| o.as_work_item().cloned())
            .collect()
    }

    /// Current resource version of the store.
    pub async fn resource_version(&self) -> u64 {
        self.state.read().await.version
    }

    fn publish(&self, state: &mut State, event: WatchEvent) {
        debug!(
            event = %event.event_type(),
            kind = %event.object().kind(),
            key = %event.object().key(),
            resource_version = event.resource_version(),
            "Store change"
        );

        state.history.push_back(event.clone());
        while state.history.len() > HISTORY_LIMIT {
            state.history.pop_front();
        }
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn insert_new(&self, state: &mut State, mut object: Object) -> StoreResult<Object> {
        let key = object.key();
        ObjectKey::new(key.namespace.clone(), key.name.clone())
            .map_err(|e| StoreError::Invalid(e.to_string()))?;

        let store_key = (object.kind(), key.clone());
        if state.objects.contains_key(&store_key) {
            return Err(StoreError::AlreadyExists {
                kind: object.kind().to_string(),
                key,
            });
        }

        state.version += 1;
        let meta = object.metadata_mut();
        meta.uid = Uid::new();
        meta.resource_version = state.version;
        meta.creation_timestamp = self.clock.now();

        state.objects.insert(store_key, object.clone());
        self.publish(state, WatchEvent::Added(object.clone()));
        Ok(object)
    }

    /// Looks up an object and checks the caller's resource version.
    fn current<'a>(
        state: &'a mut State,
        kind: Kind,
        key: &ObjectKey,
        expected_version: u64,
    ) -> StoreResult<&'a mut Object> {
        let object = state
            .objects
            .get_mut(&(kind, key.clone()))
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            })?;

        let actual = object.resource_version();
        if actual != expected_version {
            return Err(StoreError::Conflict {
                kind: kind.to_string(),
                key: key.clone(),
                expected: expected_version,
                actual,
            });
        }
        Ok(object)
    }

    fn modify<F>(
        &self,
        state: &mut State,
        kind: Kind,
        key: &ObjectKey,
        expected_version: u64,
        apply: F,
    ) -> StoreResult<Object>
    where
        F: FnOnce(&mut Object),
    {
        let version = state.version + 1;
        let object = Self::current(state, kind, key, expected_version)?;
        apply(object);
        object.metadata_mut().resource_version = version;
        let updated = object.clone();

        state.version = version;
        self.publish(state, WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    fn remove(&self, state: &mut State, kind: Kind, key: &ObjectKey) -> StoreResult<Object> {
        let mut object =
            state
                .objects
                .remove(&(kind, key.clone()))
                .ok_or_else(|| StoreError::NotFound {
                    kind: kind.to_string(),
                    key: key.clone(),
                })?;

        state.version += 1;
        object.metadata_mut().resource_version = state.version;
        self.publish(state, WatchEvent::Deleted(object.clone()));
        Ok(object)
    }

    fn take_status_fault(&self) -> Option<StoreError> {
        self.faults.lock().next_status_update.take()
    }
}

fn expect_schedule(object: Object) -> StoreResult<CronSchedule> {
    match object {
        Object::CronSchedule(s) => Ok(s),
        other => Err(StoreError::Invalid(format!(
            "expected {}, found {}",
            CronSchedule::KIND,
            other.kind()
        ))),
    }
}

fn expect_work_item(object: Object) -> StoreResult<WorkItem> {
    match object {
        Object::WorkItem(w) => Ok(w),
        other => Err(StoreError::Invalid(format!(
            "expected {}, found {}",
            WorkItem::KIND,
            other.kind()
        ))),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list(&self) -> StoreResult<Snapshot> {
        let state = self.state.read().await;
        Ok(Snapshot {
            objects: state.objects.values().cloned().collect(),
            resource_version: state.version,
        })
    }

    async fn watch(&self, from_version: u64) -> StoreResult<BoxStream<'static, WatchEvent>> {
        let state = self.state.read().await;

        if from_version < state.version {
            let oldest = state.history.front().map(WatchEvent::resource_version);
            if oldest.is_none_or(|v| v > from_version + 1) {
                return Err(StoreError::Unavailable(format!(
                    "watch from version {from_version} is no longer available"
                )));
            }
        }

        let backlog: Vec<WatchEvent> = state
            .history
            .iter()
            .filter(|e| e.resource_version() > from_version)
            .cloned()
            .collect();
        // Subscribe under the lock so no change falls between backlog and live.
        let live = BroadcastStream::new(self.events.subscribe())
            .take_while(|item| future::ready(item.is_ok()))
            .filter_map(move |item| {
                future::ready(item.ok().filter(|e| e.resource_version() > from_version))
            });

        Ok(stream::iter(backlog).chain(live).boxed())
    }

    async fn get_schedule(&self, key: &ObjectKey) -> StoreResult<CronSchedule> {
        let state = self.state.read().await;
        state
            .objects
            .get(&(Kind::CronSchedule, key.clone()))
            .and_then(Object::as_schedule)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: CronSchedule::KIND.to_string(),
                key: key.clone(),
            })
    }

    async fn create_schedule(&self, schedule: CronSchedule) -> StoreResult<CronSchedule> {
        schedule
            .validate_name()
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let mut state = self.state.write().await;
        let created = self.insert_new(&mut state, schedule.into())?;
        expect_schedule(created)
    }

    async fn update_schedule(&self, schedule: CronSchedule) -> StoreResult<CronSchedule> {
        let mut state = self.state.write().await;
        let key = schedule.metadata.key();
        let updated = self.modify(
            &mut state,
            Kind::CronSchedule,
            &key,
            schedule.metadata.resource_version,
            |object| {
                if let Object::CronSchedule(current) = object {
                    current.metadata.labels = schedule.metadata.labels;
                    current.metadata.annotations = schedule.metadata.annotations;
                    current.spec = schedule.spec;
                }
            },
        )?;
        expect_schedule(updated)
    }

    async fn update_schedule_status(&self, schedule: &CronSchedule) -> StoreResult<CronSchedule> {
        self.calls.status_updates.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_status_fault() {
            return Err(err);
        }

        let mut state = self.state.write().await;
        let updated = self.modify(
            &mut state,
            Kind::CronSchedule,
            &schedule.metadata.key(),
            schedule.metadata.resource_version,
            |object| {
                if let Object::CronSchedule(current) = object {
                    current.status = schedule.status.clone();
                }
            },
        )?;
        expect_schedule(updated)
    }

    async fn delete_schedule(&self, key: &ObjectKey, propagation: Propagation) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let deleted = self.remove(&mut state, Kind::CronSchedule, key)?;
        let owner = deleted.metadata().clone();

        let dependents: Vec<(ObjectKey, u64)> = state
            .objects
            .values()
            .filter_map(Object::as_work_item)
            .filter(|w| w.metadata.is_controlled_by(&owner))
            .map(|w| (w.metadata.key(), w.metadata.resource_version))
            .collect();

        for (child, version) in dependents {
            match propagation {
                Propagation::Background => {
                    self.remove(&mut state, Kind::WorkItem, &child)?;
                }
                Propagation::Orphan => {
                    self.modify(&mut state, Kind::WorkItem, &child, version, |object| {
                        object
                            .metadata_mut()
                            .owner_references
                            .retain(|r| r.uid != owner.uid);
                    })?;
                }
            }
        }
        Ok(())
    }

    async fn create_work_item(&self, item: WorkItem) -> StoreResult<WorkItem> {
        self.calls.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.faults.lock().next_create.take() {
            return Err(err);
        }

        let mut state = self.state.write().await;
        let created = self.insert_new(&mut state, item.into())?;
        expect_work_item(created)
    }

    async fn update_work_item_status(&self, item: &WorkItem) -> StoreResult<WorkItem> {
        self.calls.status_updates.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_status_fault() {
            return Err(err);
        }

        let mut state = self.state.write().await;
        let updated = self.modify(
            &mut state,
            Kind::WorkItem,
            &item.metadata.key(),
            item.metadata.resource_version,
            |object| {
                if let Object::WorkItem(current) = object {
                    current.status = item.status.clone();
                }
            },
        )?;
        expect_work_item(updated)
    }

    async fn delete_work_item(&self, key: &ObjectKey, _propagation: Propagation) -> StoreResult<()> {
        // Work items have no dependents, so propagation has nothing to act on.
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.faults.lock().deletes.clone() {
            return Err(err);
        }

        let mut state = self.state.write().await;
        self.remove(&mut state, Kind::WorkItem, key)?;
        Ok(())
    }
}
