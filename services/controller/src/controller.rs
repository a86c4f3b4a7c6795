//! Controller runtime: the worker pool between the cache and a reconciler.
//!
//! Cache events enqueue the owning schedule's key. Workers pull keys, run
//! one reconcile pass, and decide between forget, delayed requeue and
//! rate-limited retry. The queue guarantees a key is never reconciled by two
//! workers at once.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_api::Object;
use cadence_id::ObjectKey;
use cadence_reconcile::{Action, BackoffPolicy, WorkQueue};
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::cache::{Cache, CacheEvent, EventHandler};
use crate::error::{ControllerError, ReconcileError};

/// One reconcile pass for a key.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub workers: usize,

    /// Maximum wait for the initial cache listing.
    pub sync_timeout: Duration,

    /// Backoff applied to failed keys.
    pub backoff: BackoffPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            sync_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Enqueues the schedule a cache event belongs to.
struct EnqueueOwner {
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl EventHandler for EnqueueOwner {
    fn on_event(&self, event: &CacheEvent) {
        match event.object() {
            Object::CronSchedule(schedule) => self.queue.add(schedule.metadata.key()),
            Object::WorkItem(_) => {
                if let Some(owner) = event.owner() {
                    self.queue.add(owner.clone());
                }
            }
        }
    }
}

/// Drives a reconciler from cache events.
pub struct Controller<R: Reconcile> {
    name: String,
    cache: Arc<Cache>,
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<R>,
    config: ControllerConfig,
}

impl<R: Reconcile> Controller<R> {
    /// Creates the controller and subscribes it to `cache`.
    pub fn new(
        name: impl Into<String>,
        cache: Arc<Cache>,
        reconciler: Arc<R>,
        config: ControllerConfig,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(config.backoff));
        cache.add_handler(Arc::new(EnqueueOwner {
            queue: Arc::clone(&queue),
        }));

        Self {
            name: name.into(),
            cache,
            queue,
            reconciler,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    /// Starts the cache, waits for it to sync, then runs workers until shutdown.
    #[instrument(skip_all, fields(controller = %self.name))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        let cache_task = self.cache.start(shutdown.clone());

        info!("Waiting for cache to sync");
        if !self
            .cache
            .wait_for_sync(shutdown.clone(), self.config.sync_timeout)
            .await
        {
            self.queue.shut_down();
            if *shutdown.borrow() {
                if let Err(e) = cache_task.await {
                    error!(error = %e, "Cache task failed");
                }
                return Ok(());
            }
            cache_task.abort();
            return Err(ControllerError::CacheSyncTimeout);
        }

        let workers = self.config.workers.max(1);
        info!(workers, "Starting workers");

        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                queue: Arc::clone(&self.queue),
                reconciler: Arc::clone(&self.reconciler),
            };
            tasks.spawn(async move { worker.run().await });
        }

        // A dropped sender also means shutdown.
        let _ = shutdown.wait_for(|stop| *stop).await;
        info!("Shutting down workers");
        self.queue.shut_down();

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        if let Err(e) = cache_task.await {
            error!(error = %e, "Cache task failed");
        }

        info!("Controller stopped");
        Ok(())
    }
}

struct Worker<R> {
    id: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<R>,
}

impl<R: Reconcile> Worker<R> {
    async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, key: &ObjectKey) {
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ReconcileError::Panicked(panic_message(&*panic))));

        match outcome {
            Ok(Action::Done) => {
                self.queue.forget(key);
                debug!(key = %key, "Reconciled");
            }
            Ok(Action::RequeueAfter(delay)) => {
                self.queue.forget(key);
                self.queue.add_after(key.clone(), delay);
                debug!(key = %key, delay_ms = delay.as_millis() as u64, "Reconciled, requeued");
            }
            Err(e) => {
                let requeues = self.queue.num_requeues(key);
                let panicked = matches!(e, ReconcileError::Panicked(_));
                error!(key = %key, error = %e, requeues, panicked, "Reconcile failed, retrying");
                self.queue.add_rate_limited(key.clone());
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store, StoreError};
    use cadence_api::{CronSchedule, ObjectMeta};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Debug, Clone)]
    enum Step {
        Done,
        Requeue(Duration),
        Fail,
        Panic,
        Slow(Duration),
    }

    #[derive(Default)]
    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<ObjectKey>>,
    }

    impl Scripted {
        fn with(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Reconcile for Scripted {
        async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
            self.calls.lock().push(key.clone());
            let step = self.steps.lock().pop_front().unwrap_or(Step::Done);
            match step {
                Step::Done => Ok(Action::Done),
                Step::Requeue(delay) => Ok(Action::RequeueAfter(delay)),
                Step::Fail => Err(StoreError::Unavailable("flaky".into()).into()),
                Step::Panic => panic!("reconciler exploded"),
                Step::Slow(d) => {
                    tokio::time::sleep(d).await;
                    Ok(Action::Done)
                }
            }
        }
    }

    struct Harness {
        controller: Arc<Controller<Scripted>>,
        reconciler: Arc<Scripted>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<Result<(), ControllerError>>,
    }

    async fn start(steps: Vec<Step>) -> Harness {
        let store = Arc::new(MemoryStore::default());
        store
            .create_schedule(CronSchedule::new(
                ObjectMeta::new("default", "nightly"),
                "@daily",
            ))
            .await
            .unwrap();

        let cache = Arc::new(Cache::new(store, None));
        let reconciler = Scripted::with(steps);
        let controller = Arc::new(Controller::new(
            "test",
            cache,
            Arc::clone(&reconciler),
            ControllerConfig {
                workers: 2,
                ..Default::default()
            },
        ));

        let (shutdown, rx) = watch::channel(false);
        let task = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run(rx).await })
        };

        Harness {
            controller,
            reconciler,
            shutdown,
            task,
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met");
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "nightly").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_panics_are_retried_then_forgotten() {
        let h = start(vec![Step::Fail, Step::Panic, Step::Done]).await;

        eventually(|| h.reconciler.calls() == 3).await;
        assert_eq!(h.controller.queue().num_requeues(&key()), 0);

        h.shutdown.send_replace(true);
        h.task.await.unwrap().unwrap();
        assert_eq!(h.reconciler.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_after_delay() {
        let h = start(vec![Step::Requeue(Duration::from_secs(60))]).await;

        eventually(|| h.reconciler.calls() == 1).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.reconciler.calls(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.reconciler.calls(), 2);

        h.shutdown.send_replace(true);
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_adds_during_processing_cause_one_more_pass() {
        let h = start(vec![Step::Slow(Duration::from_secs(10))]).await;

        eventually(|| h.reconciler.calls() == 1).await;
        for _ in 0..3 {
            h.controller.queue().add(key());
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.reconciler.calls(), 2);

        h.shutdown.send_replace(true);
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_sync() {
        let store = Arc::new(MemoryStore::default());
        let cache = Arc::new(Cache::new(store, None));
        let controller = Controller::new("test", cache, Scripted::with(vec![]), Default::default());

        let (shutdown, rx) = watch::channel(true);
        controller.run(rx).await.unwrap();
        drop(shutdown);
        assert!(controller.queue().is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_sync_joins_cache() {
        let store = Arc::new(MemoryStore::default());
        let cache = Arc::new(Cache::new(store, None));
        let reconciler = Scripted::with(vec![]);
        let controller = Controller::new(
            "test",
            Arc::clone(&cache),
            Arc::clone(&reconciler),
            Default::default(),
        );

        let (_shutdown, rx) = watch::channel(true);
        controller.run(rx).await.unwrap();

        // The reflector task held its own handle on the cache until it exited.
        assert_eq!(Arc::strong_count(&cache), 2);
        assert_eq!(reconciler.calls(), 0);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(&*boxed), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }
}
