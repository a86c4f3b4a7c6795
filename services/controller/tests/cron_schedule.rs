//! End-to-end reconcile passes against the in-memory store and a fake clock.

use std::sync::Arc;
use std::time::Duration;

use cadence_api::{ConcurrencyPolicy, CronSchedule, ObjectMeta, Phase, WorkItem};
use cadence_controller::cache::Cache;
use cadence_controller::controller::{Controller, ControllerConfig, Reconcile};
use cadence_controller::reconciler::CronScheduleReconciler;
use cadence_controller::recorder::{MemoryRecorder, Reason};
use cadence_controller::store::{MemoryStore, Store, StoreError};
use cadence_id::{ObjectKey, Uid};
use cadence_reconcile::{Action, FakeClock, ScheduleConfig};
use chrono::{DateTime, Utc};
use rstest::rstest;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

fn hourly(name: &str) -> CronSchedule {
    CronSchedule::new(ObjectMeta::new("default", name), "@hourly")
}

struct Harness {
    clock: FakeClock,
    store: Arc<MemoryStore>,
    cache: Arc<Cache>,
    recorder: Arc<MemoryRecorder>,
    reconciler: CronScheduleReconciler,
    shutdown: watch::Sender<bool>,
    cache_task: Option<JoinHandle<()>>,
}

impl Harness {
    fn new() -> Self {
        let clock = FakeClock::new(at("2024-03-01T00:00:00Z"));
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let cache = Arc::new(Cache::new(store.clone(), None));
        let recorder = Arc::new(MemoryRecorder::new());
        let reconciler = CronScheduleReconciler::new(
            cache.clone(),
            store.clone(),
            Arc::new(clock.clone()),
            recorder.clone(),
            ScheduleConfig::default(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            clock,
            store,
            cache,
            recorder,
            reconciler,
            shutdown,
            cache_task: None,
        }
    }

    /// Creates `schedule` at the current fake time and starts the cache.
    async fn with_schedule(schedule: CronSchedule) -> (Self, CronSchedule) {
        let mut harness = Self::new();
        let created = harness.store.create_schedule(schedule).await.unwrap();
        harness.start().await;
        (harness, created)
    }

    async fn start(&mut self) {
        self.cache_task = Some(self.cache.start(self.shutdown.subscribe()));
        assert!(
            self.cache
                .wait_for_sync(self.shutdown.subscribe(), Duration::from_secs(5))
                .await
        );
        self.sync().await;
    }

    /// Waits until the mirror reflects every store change so far.
    async fn sync(&self) {
        let target = self.store.resource_version().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.cache.last_seen_version() < target {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("cache did not catch up with the store");
    }

    async fn stop_cache(&mut self) {
        self.shutdown.send(true).unwrap();
        if let Some(task) = self.cache_task.take() {
            task.await.unwrap();
        }
    }

    async fn pass(&self, key: &ObjectKey) -> Action {
        self.sync().await;
        self.reconciler.reconcile(key).await.unwrap()
    }

    async fn children(&self) -> Vec<WorkItem> {
        self.store.work_items().await
    }

    async fn child_names(&self) -> Vec<String> {
        self.children()
            .await
            .into_iter()
            .map(|c| c.metadata.name)
            .collect()
    }

    async fn seed_child(
        &self,
        owner: &CronSchedule,
        scheduled: &str,
        phase: Phase,
        start_time: Option<DateTime<Utc>>,
    ) -> WorkItem {
        let mut item = WorkItem::from_template(owner, at(scheduled)).unwrap();
        item.status.phase = phase;
        item.status.start_time = start_time;
        self.store.create_work_item(item).await.unwrap()
    }

    async fn set_phase(&self, name: &str, phase: Phase) {
        let mut item = self
            .children()
            .await
            .into_iter()
            .find(|c| c.metadata.name == name)
            .unwrap();
        item.status.phase = phase;
        self.store.update_work_item_status(&item).await.unwrap();
    }

    async fn last_schedule_time(&self, key: &ObjectKey) -> Option<DateTime<Utc>> {
        self.store
            .get_schedule(key)
            .await
            .unwrap()
            .status
            .last_schedule_time
    }
}

fn child_name(owner: &str, scheduled: &str) -> String {
    WorkItem::child_name(owner, at(scheduled))
}

#[tokio::test]
async fn missing_schedule_is_done() {
    let mut harness = Harness::new();
    harness.start().await;

    let key = ObjectKey::new("default", "gone").unwrap();
    assert_eq!(harness.pass(&key).await, Action::Done);
    assert!(harness.recorder.events().is_empty());
}

#[tokio::test]
async fn launches_only_latest_missed_run() {
    let (harness, schedule) = Harness::with_schedule(hourly("nightly")).await;
    let key = schedule.metadata.key();
    harness.clock.set(at("2024-03-01T05:30:00Z"));

    let action = harness.pass(&key).await;
    assert_eq!(action, Action::RequeueAfter(minutes(30)));

    let children = harness.children().await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].scheduled_time().unwrap(), at("2024-03-01T05:00:00Z"));
    assert!(children[0].metadata.is_controlled_by(&schedule.metadata));
    assert_eq!(harness.recorder.count(Reason::SuccessfulCreate), 1);

    // The launched child now pins lastScheduleTime; no further catch-up.
    let action = harness.pass(&key).await;
    assert_eq!(action, Action::RequeueAfter(minutes(30)));
    assert_eq!(harness.children().await.len(), 1);
    assert_eq!(
        harness.last_schedule_time(&key).await,
        Some(at("2024-03-01T05:00:00Z"))
    );
}

#[tokio::test]
async fn no_missed_run_requeues_for_next_fire() {
    let (harness, schedule) = Harness::with_schedule(hourly("nightly")).await;
    harness.clock.set(at("2024-03-01T00:45:00Z"));

    let action = harness.pass(&schedule.metadata.key()).await;
    assert_eq!(action, Action::RequeueAfter(minutes(15)));
    assert!(harness.children().await.is_empty());
    assert_eq!(
        harness.last_schedule_time(&schedule.metadata.key()).await,
        Some(at("2024-03-01T00:00:00Z"))
    );
}

#[tokio::test]
async fn launch_is_idempotent_against_stale_cache() {
    let (mut harness, schedule) = Harness::with_schedule(hourly("nightly")).await;
    harness.clock.set(at("2024-03-01T01:30:00Z"));

    // Another process launched the run; this cache never hears about it.
    harness.stop_cache().await;
    harness
        .seed_child(&schedule, "2024-03-01T01:00:00Z", Phase::Pending, None)
        .await;

    let action = harness
        .reconciler
        .reconcile(&schedule.metadata.key())
        .await
        .unwrap();
    assert_eq!(action, Action::RequeueAfter(minutes(30)));

    assert_eq!(harness.children().await.len(), 1);
    assert_eq!(harness.store.create_calls(), 2);
    assert_eq!(harness.recorder.count(Reason::SuccessfulCreate), 0);
    assert_eq!(harness.recorder.count(Reason::FailedCreate), 0);
}

#[tokio::test]
async fn too_many_missed_runs_stops_without_requeue() {
    let schedule = CronSchedule::new(ObjectMeta::new("default", "chatty"), "* * * * *");
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    harness.clock.set(at("2024-03-01T02:00:00Z"));

    let action = harness.pass(&schedule.metadata.key()).await;
    assert_eq!(action, Action::Done);
    assert!(harness.children().await.is_empty());
    assert_eq!(harness.recorder.count(Reason::TooManyMissedRuns), 1);
}

#[tokio::test]
async fn exactly_cap_missed_runs_still_launches() {
    let schedule = CronSchedule::new(ObjectMeta::new("default", "chatty"), "* * * * *");
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    harness.clock.set(at("2024-03-01T01:40:30Z"));

    let action = harness.pass(&schedule.metadata.key()).await;
    assert_eq!(action, Action::RequeueAfter(Duration::from_secs(30)));
    assert_eq!(
        harness.child_names().await,
        vec![child_name("chatty", "2024-03-01T01:40:00Z")]
    );
}

#[rstest]
#[case::allow(ConcurrencyPolicy::Allow, 2, 0)]
#[case::forbid(ConcurrencyPolicy::Forbid, 1, 0)]
#[case::replace(ConcurrencyPolicy::Replace, 1, 1)]
#[tokio::test]
async fn concurrency_policy_with_active_child(
    #[case] policy: ConcurrencyPolicy,
    #[case] expected_children: usize,
    #[case] expected_deletes: usize,
) {
    let mut schedule = hourly("nightly");
    schedule.spec.concurrency_policy = policy;
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    let key = schedule.metadata.key();

    harness.clock.set(at("2024-03-01T01:30:00Z"));
    harness.pass(&key).await;
    harness.set_phase(&child_name("nightly", "2024-03-01T01:00:00Z"), Phase::Running).await;

    harness.clock.set(at("2024-03-01T02:30:00Z"));
    let action = harness.pass(&key).await;

    assert_eq!(action, Action::RequeueAfter(minutes(30)));
    assert_eq!(harness.children().await.len(), expected_children);
    assert_eq!(harness.recorder.count(Reason::SuccessfulDelete), expected_deletes);
}

#[tokio::test]
async fn forbid_launches_once_active_child_finishes() {
    let mut schedule = hourly("nightly");
    schedule.spec.concurrency_policy = ConcurrencyPolicy::Forbid;
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    let key = schedule.metadata.key();
    let first = child_name("nightly", "2024-03-01T01:00:00Z");

    harness.clock.set(at("2024-03-01T01:30:00Z"));
    harness.pass(&key).await;

    harness.clock.set(at("2024-03-01T02:30:00Z"));
    harness.pass(&key).await;
    assert_eq!(harness.child_names().await, vec![first.clone()]);
    assert_eq!(harness.recorder.count(Reason::JobAlreadyActive), 1);

    harness.set_phase(&first, Phase::Succeeded).await;
    harness.pass(&key).await;

    let mut names = harness.child_names().await;
    names.sort();
    assert_eq!(
        names,
        vec![first, child_name("nightly", "2024-03-01T02:00:00Z")]
    );
}

#[tokio::test]
async fn replace_deletes_active_and_launches_missed() {
    let mut schedule = hourly("nightly");
    schedule.spec.concurrency_policy = ConcurrencyPolicy::Replace;
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    let key = schedule.metadata.key();

    harness.clock.set(at("2024-03-01T01:30:00Z"));
    harness.pass(&key).await;

    harness.clock.set(at("2024-03-01T02:30:00Z"));
    let deletes_before = harness.store.delete_calls();
    harness.pass(&key).await;

    assert_eq!(harness.store.delete_calls(), deletes_before + 1);
    let children = harness.children().await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].scheduled_time().unwrap(), at("2024-03-01T02:00:00Z"));
}

#[tokio::test]
async fn replace_delete_failure_is_best_effort() {
    let mut schedule = hourly("nightly");
    schedule.spec.concurrency_policy = ConcurrencyPolicy::Replace;
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    let key = schedule.metadata.key();

    harness.clock.set(at("2024-03-01T01:30:00Z"));
    harness.pass(&key).await;

    harness
        .store
        .fail_deletes(Some(StoreError::Unavailable("store down".to_string())));
    harness.clock.set(at("2024-03-01T02:30:00Z"));
    let action = harness.pass(&key).await;

    assert_eq!(action, Action::RequeueAfter(minutes(30)));
    assert_eq!(harness.recorder.count(Reason::FailedDelete), 1);
    assert_eq!(harness.children().await.len(), 2);
}

#[tokio::test]
async fn prunes_oldest_successful_children() {
    let mut schedule = CronSchedule::new(ObjectMeta::new("default", "daily"), "@daily");
    schedule.spec.successful_history_limit = Some(2);
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    let key = schedule.metadata.key();

    // Start times run opposite to scheduled times so the order is by start.
    let seeds = [
        ("2024-03-01T01:00:00Z", Some(at("2024-03-01T09:00:00Z"))),
        ("2024-03-01T02:00:00Z", Some(at("2024-03-01T08:00:00Z"))),
        ("2024-03-01T03:00:00Z", Some(at("2024-03-01T07:00:00Z"))),
        ("2024-03-01T04:00:00Z", None),
        ("2024-03-01T05:00:00Z", Some(at("2024-03-01T06:00:00Z"))),
    ];
    for (scheduled, start) in seeds {
        harness
            .seed_child(&schedule, scheduled, Phase::Succeeded, start)
            .await;
    }
    harness.clock.set(at("2024-03-01T10:00:00Z"));

    let action = harness.pass(&key).await;
    assert_eq!(action, Action::RequeueAfter(minutes(14 * 60)));

    let mut names = harness.child_names().await;
    names.sort();
    assert_eq!(
        names,
        vec![
            child_name("daily", "2024-03-01T01:00:00Z"),
            child_name("daily", "2024-03-01T02:00:00Z"),
        ]
    );
    assert_eq!(harness.recorder.count(Reason::SuccessfulDelete), 3);
    assert_eq!(
        harness.last_schedule_time(&key).await,
        Some(at("2024-03-01T05:00:00Z"))
    );
}

#[tokio::test]
async fn prune_failures_do_not_fail_the_pass() {
    let mut schedule = hourly("nightly");
    schedule.spec.failed_history_limit = Some(0);
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    harness
        .seed_child(&schedule, "2024-03-01T00:00:00Z", Phase::Failed, None)
        .await;
    harness
        .store
        .fail_deletes(Some(StoreError::Unavailable("store down".to_string())));
    harness.clock.set(at("2024-03-01T00:10:00Z"));

    let action = harness.pass(&schedule.metadata.key()).await;
    assert_eq!(action, Action::RequeueAfter(minutes(50)));
    assert_eq!(harness.recorder.count(Reason::FailedDelete), 1);
    assert_eq!(harness.children().await.len(), 1);
}

#[tokio::test]
async fn stale_miss_past_starting_deadline_is_abandoned() {
    let mut schedule = hourly("nightly");
    schedule.spec.starting_deadline_seconds = Some(60);
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    harness.clock.set(at("2024-03-01T01:02:00Z"));

    let action = harness.pass(&schedule.metadata.key()).await;
    assert_eq!(action, Action::RequeueAfter(minutes(58)));
    assert!(harness.children().await.is_empty());
}

#[tokio::test]
async fn miss_within_starting_deadline_launches() {
    let mut schedule = hourly("nightly");
    schedule.spec.starting_deadline_seconds = Some(300);
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    harness.clock.set(at("2024-03-01T01:02:00Z"));

    harness.pass(&schedule.metadata.key()).await;
    assert_eq!(
        harness.child_names().await,
        vec![child_name("nightly", "2024-03-01T01:00:00Z")]
    );
}

#[rstest]
#[case::negative(-60)]
#[case::out_of_range(i64::MAX)]
#[tokio::test]
async fn unusable_starting_deadline_stops_without_requeue(#[case] secs: i64) {
    let mut schedule = hourly("nightly");
    schedule.spec.starting_deadline_seconds = Some(secs);
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    harness.clock.set(at("2024-03-01T05:00:30Z"));

    assert_eq!(harness.pass(&schedule.metadata.key()).await, Action::Done);
    assert_eq!(harness.recorder.count(Reason::InvalidSchedule), 1);
    assert!(harness.children().await.is_empty());
}

#[tokio::test]
async fn last_schedule_time_never_decreases() {
    let mut schedule = hourly("nightly");
    schedule.spec.successful_history_limit = Some(0);
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    let key = schedule.metadata.key();
    let child = child_name("nightly", "2024-03-01T01:00:00Z");
    harness.clock.set(at("2024-03-01T01:30:00Z"));

    let mut seen = Vec::new();

    harness.pass(&key).await;
    seen.push(harness.last_schedule_time(&key).await);

    harness.pass(&key).await;
    seen.push(harness.last_schedule_time(&key).await);

    harness.set_phase(&child, Phase::Succeeded).await;
    harness.pass(&key).await;
    seen.push(harness.last_schedule_time(&key).await);
    assert!(harness.children().await.is_empty());
    assert_eq!(harness.recorder.count(Reason::SawCompletedJob), 1);

    // The child that set it is gone; the recorded time must hold.
    harness.pass(&key).await;
    seen.push(harness.last_schedule_time(&key).await);

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last().copied().flatten(), Some(at("2024-03-01T01:00:00Z")));
    assert_eq!(harness.children().await.len(), 0);
}

#[tokio::test]
async fn status_tracks_active_children() {
    let (harness, schedule) = Harness::with_schedule(hourly("nightly")).await;
    let key = schedule.metadata.key();
    harness.clock.set(at("2024-03-01T01:30:00Z"));

    harness.pass(&key).await;
    harness.pass(&key).await;

    let status = harness.store.get_schedule(&key).await.unwrap().status;
    assert_eq!(status.active.len(), 1);
    assert_eq!(status.active[0].name, child_name("nightly", "2024-03-01T01:00:00Z"));

    // Nothing changed, so no further status write.
    let writes = harness.store.status_update_calls();
    harness.pass(&key).await;
    assert_eq!(harness.store.status_update_calls(), writes);
}

#[tokio::test]
async fn children_of_previous_owner_are_not_adopted() {
    let (harness, schedule) = Harness::with_schedule(hourly("nightly")).await;

    // Same owner name, different UID: left behind by a deleted predecessor.
    let mut stray = WorkItem::from_template(&schedule, at("2024-03-01T00:00:00Z")).unwrap();
    stray.metadata.owner_references[0].uid = Uid::new();
    stray.status.phase = Phase::Running;
    harness.store.create_work_item(stray).await.unwrap();

    let key = schedule.metadata.key();
    harness.pass(&key).await;

    let status = harness.store.get_schedule(&key).await.unwrap().status;
    assert!(status.active.is_empty());
    assert_eq!(status.last_schedule_time, Some(at("2024-03-01T00:00:00Z")));
    assert_eq!(harness.cache.work_items_for(&key).len(), 1);
}

#[tokio::test]
async fn suspended_schedule_only_updates_status() {
    let mut schedule = hourly("nightly");
    schedule.spec.suspend = true;
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    harness.clock.set(at("2024-03-01T05:30:00Z"));

    assert_eq!(harness.pass(&schedule.metadata.key()).await, Action::Done);
    assert!(harness.children().await.is_empty());
    assert_eq!(
        harness.last_schedule_time(&schedule.metadata.key()).await,
        Some(at("2024-03-01T00:00:00Z"))
    );
}

#[rstest]
#[case::unparseable("every tuesday", Reason::InvalidSchedule)]
#[case::never_fires("0 0 30 2 *", Reason::InvalidSchedule)]
#[tokio::test]
async fn malformed_schedule_stops_without_requeue(#[case] expr: &str, #[case] reason: Reason) {
    let schedule = CronSchedule::new(ObjectMeta::new("default", "broken"), expr);
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    harness.clock.set(at("2024-03-01T05:30:00Z"));

    assert_eq!(harness.pass(&schedule.metadata.key()).await, Action::Done);
    assert_eq!(harness.recorder.count(reason), 1);
    assert!(harness.children().await.is_empty());
}

#[tokio::test]
async fn malformed_template_stops_without_requeue() {
    let mut schedule = hourly("nightly");
    schedule.spec.template.spec = serde_json::Value::Null;
    let (harness, schedule) = Harness::with_schedule(schedule).await;
    harness.clock.set(at("2024-03-01T01:30:00Z"));

    assert_eq!(harness.pass(&schedule.metadata.key()).await, Action::Done);
    assert_eq!(harness.recorder.count(Reason::InvalidTemplate), 1);
    assert!(harness.children().await.is_empty());
}

#[tokio::test]
async fn create_failure_is_retryable() {
    let (harness, schedule) = Harness::with_schedule(hourly("nightly")).await;
    harness.clock.set(at("2024-03-01T01:30:00Z"));
    harness
        .store
        .fail_next_create(StoreError::Unavailable("store down".to_string()));

    harness.sync().await;
    let result = harness.reconciler.reconcile(&schedule.metadata.key()).await;
    assert!(result.is_err());
    assert_eq!(harness.recorder.count(Reason::FailedCreate), 1);

    // The retry launches normally.
    harness.pass(&schedule.metadata.key()).await;
    assert_eq!(harness.children().await.len(), 1);
}

#[tokio::test]
async fn status_write_failure_is_retryable() {
    let (harness, schedule) = Harness::with_schedule(hourly("nightly")).await;
    harness.clock.set(at("2024-03-01T01:30:00Z"));
    harness.store.fail_next_status_update(StoreError::Conflict {
        kind: CronSchedule::KIND.to_string(),
        key: schedule.metadata.key(),
        expected: 1,
        actual: 2,
    });

    harness.sync().await;
    let result = harness.reconciler.reconcile(&schedule.metadata.key()).await;
    assert!(result.is_err());
    assert_eq!(harness.recorder.count(Reason::FailedUpdateStatus), 1);
    assert!(harness.children().await.is_empty());
}

#[tokio::test]
async fn controller_launches_from_cache_events() {
    let clock = FakeClock::new(at("2024-03-01T00:00:00Z"));
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    store.create_schedule(hourly("nightly")).await.unwrap();
    clock.set(at("2024-03-01T03:30:00Z"));

    let cache = Arc::new(Cache::new(store.clone(), None));
    let recorder = Arc::new(MemoryRecorder::new());
    let reconciler = Arc::new(CronScheduleReconciler::new(
        cache.clone(),
        store.clone(),
        Arc::new(clock.clone()),
        recorder.clone(),
        ScheduleConfig::default(),
    ));
    let controller = Controller::new("cron-schedule", cache, reconciler, ControllerConfig::default());

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { controller.run(rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let items = store.work_items().await;
            let active = store
                .get_schedule(&ObjectKey::new("default", "nightly").unwrap())
                .await
                .unwrap()
                .status
                .active;
            if items.len() == 1 && active.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("controller did not converge");

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let items = store.work_items().await;
    assert_eq!(items[0].scheduled_time().unwrap(), at("2024-03-01T03:00:00Z"));
    assert_eq!(recorder.count(Reason::SuccessfulCreate), 1);
}
