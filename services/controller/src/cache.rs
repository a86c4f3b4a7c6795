//! Local mirror of the store, fed by list and watch.
//!
//! The cache owns the only writer of the mirror (its reflector task). Every
//! read is served from memory, so reconcile passes never wait on the store.
//! Changes are translated into [`CacheEvent`]s at this boundary, with the
//! owning schedule already resolved from the child-to-owner index.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_api::{CronSchedule, Object, WatchEvent, WorkItem};
use cadence_id::ObjectKey;
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, instrument, warn};

use crate::store::Store;

/// Pause before re-listing after a failed list or a closed watch.
const RELIST_BACKOFF: Duration = Duration::from_secs(1);

/// A change to the mirror, as seen by event handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Added {
        object: Object,
        owner: Option<ObjectKey>,
    },
    /// Also emitted on resync, with `old == new`.
    Updated {
        old: Object,
        new: Object,
        owner: Option<ObjectKey>,
    },
    /// `final_state_unknown` is set when the delete was inferred from a
    /// re-list rather than observed on the watch; `last_known` may be stale.
    Deleted {
        last_known: Object,
        final_state_unknown: bool,
        owner: Option<ObjectKey>,
    },
}

impl CacheEvent {
    /// The object in its most recent known state.
    pub fn object(&self) -> &Object {
        match self {
            CacheEvent::Added { object, .. } => object,
            CacheEvent::Updated { new, .. } => new,
            CacheEvent::Deleted { last_known, .. } => last_known,
        }
    }

    /// The controlling schedule of a work item, if any.
    pub fn owner(&self) -> Option<&ObjectKey> {
        match self {
            CacheEvent::Added { owner, .. }
            | CacheEvent::Updated { owner, .. }
            | CacheEvent::Deleted { owner, .. } => owner.as_ref(),
        }
    }
}

/// Receives cache events. Called from the reflector task; must not block.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

#[derive(Default)]
struct Mirror {
    schedules: HashMap<ObjectKey, CronSchedule>,
    work_items: HashMap<ObjectKey, WorkItem>,
    /// child -> owner
    owners: HashMap<ObjectKey, ObjectKey>,
    /// owner -> children
    children: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
}

impl Mirror {
    fn get(&self, object: &Object) -> Option<Object> {
        let key = object.key();
        match object {
            Object::CronSchedule(_) => self.schedules.get(&key).cloned().map(Object::from),
            Object::WorkItem(_) => self.work_items.get(&key).cloned().map(Object::from),
        }
    }

    fn owner_key(item: &WorkItem) -> Option<ObjectKey> {
        item.metadata
            .controller_of()
            .filter(|r| r.kind == CronSchedule::KIND)
            .map(|r| ObjectKey {
                namespace: item.metadata.namespace.clone(),
                name: r.name.clone(),
            })
    }

    fn unindex(&mut self, child: &ObjectKey) -> Option<ObjectKey> {
        let owner = self.owners.remove(child)?;
        if let Some(children) = self.children.get_mut(&owner) {
            children.remove(child);
            if children.is_empty() {
                self.children.remove(&owner);
            }
        }
        Some(owner)
    }

    /// Stores `object`, keeping the owner index in step. Returns its owner.
    fn upsert(&mut self, object: Object) -> Option<ObjectKey> {
        match object {
            Object::CronSchedule(schedule) => {
                self.schedules.insert(schedule.metadata.key(), schedule);
                None
            }
            Object::WorkItem(item) => {
                let key = item.metadata.key();
                self.unindex(&key);
                let owner = Self::owner_key(&item);
                if let Some(owner) = &owner {
                    self.owners.insert(key.clone(), owner.clone());
                    self.children
                        .entry(owner.clone())
                        .or_default()
                        .insert(key.clone());
                }
                self.work_items.insert(key, item);
                owner
            }
        }
    }

    /// Removes `object`. Returns the cached state and its owner.
    fn delete(&mut self, object: &Object) -> (Option<Object>, Option<ObjectKey>) {
        let key = object.key();
        match object {
            Object::CronSchedule(_) => (self.schedules.remove(&key).map(Object::from), None),
            Object::WorkItem(_) => {
                let owner = self.unindex(&key);
                (self.work_items.remove(&key).map(Object::from), owner)
            }
        }
    }

    fn all(&self) -> Vec<Object> {
        self.schedules
            .values()
            .cloned()
            .map(Object::from)
            .chain(self.work_items.values().cloned().map(Object::from))
            .collect()
    }
}

/// Indexed, eventually consistent mirror of the store.
pub struct Cache {
    store: Arc<dyn Store>,
    resync: Option<Duration>,
    mirror: RwLock<Mirror>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    synced: watch::Sender<bool>,
    last_seen_version: AtomicU64,
}

impl Cache {
    /// Creates a cache over `store`. `resync` of `None` disables periodic resync.
    pub fn new(store: Arc<dyn Store>, resync: Option<Duration>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            store,
            resync: resync.filter(|d| !d.is_zero()),
            mirror: RwLock::new(Mirror::default()),
            handlers: RwLock::new(Vec::new()),
            synced,
            last_seen_version: AtomicU64::new(0),
        }
    }

    /// Registers a handler. Handlers added after `start` miss earlier events.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().push(handler);
    }

    /// Starts the background reflector. Returns immediately.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.run(shutdown).await })
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits for the initial listing to land in the mirror.
    ///
    /// Returns `false` on shutdown or after `timeout`.
    pub async fn wait_for_sync(
        &self,
        mut shutdown: watch::Receiver<bool>,
        timeout: Duration,
    ) -> bool {
        let mut synced = self.synced.subscribe();
        tokio::select! {
            result = synced.wait_for(|s| *s) => result.is_ok(),
            _ = shutdown.wait_for(|s| *s) => false,
            _ = tokio::time::sleep(timeout) => false,
        }
    }

    pub fn schedule(&self, key: &ObjectKey) -> Option<CronSchedule> {
        self.mirror.read().schedules.get(key).cloned()
    }

    pub fn work_item(&self, key: &ObjectKey) -> Option<WorkItem> {
        self.mirror.read().work_items.get(key).cloned()
    }

    pub fn schedules(&self) -> Vec<CronSchedule> {
        self.mirror.read().schedules.values().cloned().collect()
    }

    /// Work items whose controller reference names `owner`, in key order.
    pub fn work_items_for(&self, owner: &ObjectKey) -> Vec<WorkItem> {
        let mirror = self.mirror.read();
        mirror
            .children
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|child| mirror.work_items.get(child).cloned())
            .collect()
    }

    pub fn owner_of(&self, child: &ObjectKey) -> Option<ObjectKey> {
        self.mirror.read().owners.get(child).cloned()
    }

    /// Highest store resource version reflected in the mirror.
    pub fn last_seen_version(&self) -> u64 {
        self.last_seen_version.load(Ordering::SeqCst)
    }

    #[instrument(skip_all)]
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            resync_secs = self.resync.map(|d| d.as_secs()),
            "Starting cache reflector"
        );

        let mut resync = self
            .resync
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            match self.list_and_watch(&mut shutdown, &mut resync).await {
                Ok(()) => {
                    info!("Cache reflector shutting down");
                    return;
                }
                Err(reason) => {
                    warn!(reason = %reason, "Cache watch interrupted, re-listing");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RELIST_BACKOFF) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Cache reflector shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Lists, then follows the watch. `Ok` means shutdown was requested.
    async fn list_and_watch(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        resync: &mut Option<Interval>,
    ) -> Result<(), String> {
        if *shutdown.borrow() {
            return Ok(());
        }

        let snapshot = self.store.list().await.map_err(|e| e.to_string())?;
        let version = snapshot.resource_version;
        self.replace(snapshot.objects);
        self.last_seen_version.fetch_max(version, Ordering::SeqCst);
        self.synced.send_replace(true);
        debug!(resource_version = version, "Cache listed");

        let mut events = self.store.watch(version).await.map_err(|e| e.to_string())?;

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => self.apply(event),
                    None => return Err("watch stream closed".to_string()),
                },
                _ = tick(resync) => self.resync_all(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Replaces the mirror with a fresh listing, emitting the difference.
    fn replace(&self, objects: Vec<Object>) {
        let mut events = Vec::new();
        {
            let mut mirror = self.mirror.write();
            let mut seen_schedules = BTreeSet::new();
            let mut seen_items = BTreeSet::new();

            for object in objects {
                match &object {
                    Object::CronSchedule(s) => seen_schedules.insert(s.metadata.key()),
                    Object::WorkItem(w) => seen_items.insert(w.metadata.key()),
                };

                let old = mirror.get(&object);
                match old {
                    Some(old) if old.resource_version() == object.resource_version() => {}
                    Some(old) => {
                        let owner = mirror.upsert(object.clone());
                        events.push(CacheEvent::Updated {
                            old,
                            new: object,
                            owner,
                        });
                    }
                    None => {
                        let owner = mirror.upsert(object.clone());
                        events.push(CacheEvent::Added { object, owner });
                    }
                }
            }

            let gone: Vec<Object> = mirror
                .all()
                .into_iter()
                .filter(|o| match o {
                    Object::CronSchedule(s) => !seen_schedules.contains(&s.metadata.key()),
                    Object::WorkItem(w) => !seen_items.contains(&w.metadata.key()),
                })
                .collect();
            for object in gone {
                let (last_known, owner) = mirror.delete(&object);
                if let Some(last_known) = last_known {
                    events.push(CacheEvent::Deleted {
                        last_known,
                        final_state_unknown: true,
                        owner,
                    });
                }
            }
        }

        self.dispatch(&events);
    }

    /// Applies one watch event to the mirror.
    fn apply(&self, event: WatchEvent) {
        let version = event.resource_version();
        let cache_event = {
            let mut mirror = self.mirror.write();
            let current = mirror.get(event.object());

            match current {
                // Never move an object backwards.
                Some(current) if current.resource_version() >= version => {
                    debug!(
                        key = %current.key(),
                        cached = current.resource_version(),
                        received = version,
                        "Ignoring stale watch event"
                    );
                    None
                }
                current => Some(Self::ingest(&mut mirror, current, event)),
            }
        };

        self.last_seen_version.fetch_max(version, Ordering::SeqCst);
        if let Some(cache_event) = cache_event {
            self.dispatch(std::slice::from_ref(&cache_event));
        }
    }

    fn ingest(mirror: &mut Mirror, current: Option<Object>, event: WatchEvent) -> CacheEvent {
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                let owner = mirror.upsert(object.clone());
                match current {
                    Some(old) => CacheEvent::Updated {
                        old,
                        new: object,
                        owner,
                    },
                    None => CacheEvent::Added { object, owner },
                }
            }
            WatchEvent::Deleted(object) => {
                let (_, indexed_owner) = mirror.delete(&object);
                let owner = indexed_owner.or_else(|| match &object {
                    Object::WorkItem(w) => Mirror::owner_key(w),
                    Object::CronSchedule(_) => None,
                });
                CacheEvent::Deleted {
                    last_known: object,
                    final_state_unknown: false,
                    owner,
                }
            }
        }
    }

    /// Re-delivers every cached object as an update.
    fn resync_all(&self) {
        let events: Vec<CacheEvent> = {
            let mirror = self.mirror.read();
            mirror
                .all()
                .into_iter()
                .map(|object| {
                    let owner = match &object {
                        Object::WorkItem(w) => mirror.owners.get(&w.metadata.key()).cloned(),
                        Object::CronSchedule(_) => None,
                    };
                    CacheEvent::Updated {
                        old: object.clone(),
                        new: object,
                        owner,
                    }
                })
                .collect()
        };

        debug!(objects = events.len(), "Cache resync");
        self.dispatch(&events);
    }

    fn dispatch(&self, events: &[CacheEvent]) {
        if events.is_empty() {
            return;
        }
        let handlers = self.handlers.read().clone();
        for event in events {
            for handler in &handlers {
                handler.on_event(event);
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
