//! Reconciler for `CronSchedule` objects.
//!
//! Each pass re-derives everything from the cached schedule and its
//! children:
//!
//! 1. fetch the schedule (gone means done)
//! 2. bucket its children by phase and find the latest scheduled-at time
//! 3. write status if it changed
//! 4. prune finished children beyond the history limits (best effort)
//! 5. stop if suspended
//! 6. compute the latest missed fire and the next fire
//! 7. apply the starting deadline and the concurrency policy
//! 8. launch at most one work item for the missed fire
//! 9. requeue for the next fire

use std::sync::Arc;

use async_trait::async_trait;
use cadence_api::{
    ConcurrencyPolicy, CronSchedule, CronScheduleStatus, ObjectReference, WorkItem,
};
use cadence_id::ObjectKey;
use cadence_reconcile::{
    partition_work_items, select_for_pruning, Action, Clock, CronExpr, ScheduleConfig,
    ScheduleDecision, ScheduleError,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::cache::Cache;
use crate::controller::Reconcile;
use crate::error::ReconcileError;
use crate::recorder::{EventRecorder, Reason};
use crate::store::{Propagation, Store};

/// Children of one schedule, bucketed by phase.
#[derive(Debug, Clone, Default)]
pub struct Observed {
    pub active: Vec<WorkItem>,
    pub succeeded: Vec<WorkItem>,
    pub failed: Vec<WorkItem>,
    /// Latest valid scheduled-at annotation among all children.
    pub latest_scheduled: Option<DateTime<Utc>>,
}

impl Observed {
    /// Buckets `children`. Children without a readable scheduled-at
    /// annotation are still bucketed but do not move `latest_scheduled`.
    pub fn from_children(children: &[WorkItem]) -> Self {
        let partition = partition_work_items(children);

        let mut latest_scheduled = None;
        for child in children {
            match child.scheduled_time() {
                Ok(t) => latest_scheduled = latest_scheduled.max(Some(t)),
                Err(e) => debug!(
                    child = %child.metadata.key(),
                    error = %e,
                    "Skipping child without a scheduled time"
                ),
            }
        }

        let owned = |items: Vec<&WorkItem>| items.into_iter().cloned().collect::<Vec<_>>();
        Self {
            active: owned(partition.active),
            succeeded: owned(partition.succeeded),
            failed: owned(partition.failed),
            latest_scheduled,
        }
    }
}

/// Status implied by the observed children.
///
/// `last_schedule_time` never decreases and never precedes creation.
pub fn desired_status(schedule: &CronSchedule, observed: &Observed) -> CronScheduleStatus {
    let last_schedule_time = [
        Some(schedule.metadata.creation_timestamp),
        schedule.status.last_schedule_time,
        observed.latest_scheduled,
    ]
    .into_iter()
    .flatten()
    .max();

    let mut active: Vec<ObjectReference> = observed
        .active
        .iter()
        .map(WorkItem::object_reference)
        .collect();
    active.sort();

    CronScheduleStatus {
        last_schedule_time,
        active,
    }
}

/// Converges `CronSchedule` objects.
pub struct CronScheduleReconciler {
    cache: Arc<Cache>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn EventRecorder>,
    config: ScheduleConfig,
}

impl CronScheduleReconciler {
    pub fn new(
        cache: Arc<Cache>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        recorder: Arc<dyn EventRecorder>,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            recorder,
            config,
        }
    }

    /// Children the schedule controls, matched by UID.
    fn children_of(&self, schedule: &CronSchedule) -> Vec<WorkItem> {
        self.cache
            .work_items_for(&schedule.metadata.key())
            .into_iter()
            .filter(|item| item.metadata.is_controlled_by(&schedule.metadata))
            .collect()
    }

    async fn update_status(
        &self,
        key: &ObjectKey,
        schedule: &CronSchedule,
        observed: &Observed,
    ) -> Result<CronSchedule, ReconcileError> {
        for reference in &schedule.status.active {
            let finished = observed
                .succeeded
                .iter()
                .chain(&observed.failed)
                .find(|item| item.metadata.uid == reference.uid);
            if let Some(item) = finished {
                self.recorder.normal(
                    key,
                    Reason::SawCompletedJob,
                    format!(
                        "Saw completed work item {}, phase {}",
                        item.metadata.name,
                        item.phase()
                    ),
                );
            }
        }

        let status = desired_status(schedule, observed);
        if status == schedule.status {
            return Ok(schedule.clone());
        }

        let mut updated = schedule.clone();
        updated.status = status;
        match self.store.update_schedule_status(&updated).await {
            Ok(written) => {
                debug!(
                    active = written.status.active.len(),
                    last_schedule_time = ?written.status.last_schedule_time,
                    "Status updated"
                );
                Ok(written)
            }
            Err(e) => {
                self.recorder.warning(
                    key,
                    Reason::FailedUpdateStatus,
                    format!("Failed to update status: {e}"),
                );
                Err(e.into())
            }
        }
    }

    /// Deletes the oldest finished children beyond each history limit.
    async fn prune_history(&self, key: &ObjectKey, schedule: &CronSchedule, observed: &Observed) {
        let buckets = [
            ("failed", &observed.failed, schedule.spec.failed_history_limit),
            (
                "succeeded",
                &observed.succeeded,
                schedule.spec.successful_history_limit,
            ),
        ];

        for (bucket, items, limit) in buckets {
            let Some(limit) = limit else {
                continue;
            };
            let doomed = select_for_pruning(
                items.iter().collect::<Vec<_>>(),
                limit as usize,
                |item: &&WorkItem| item.status.start_time,
            );
            for item in doomed {
                self.delete_child(key, item, bucket).await;
            }
        }
    }

    /// Best-effort delete. Returns whether the child is gone.
    async fn delete_child(&self, key: &ObjectKey, item: &WorkItem, why: &str) -> bool {
        let child = item.metadata.key();
        match self
            .store
            .delete_work_item(&child, Propagation::Background)
            .await
        {
            Ok(()) => {
                info!(child = %child, why, "Deleted work item");
                self.recorder.normal(
                    key,
                    Reason::SuccessfulDelete,
                    format!("Deleted work item {}", child.name),
                );
                true
            }
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                warn!(child = %child, why, error = %e, "Failed to delete work item");
                self.recorder.warning(
                    key,
                    Reason::FailedDelete,
                    format!("Failed to delete work item {}: {e}", child.name),
                );
                false
            }
        }
    }

    /// Runs the schedule engine, recording non-retryable failures.
    ///
    /// Returns the decision along with the validated starting deadline.
    fn decide(
        &self,
        key: &ObjectKey,
        schedule: &CronSchedule,
        now: DateTime<Utc>,
    ) -> Option<(ScheduleDecision, Option<chrono::Duration>)> {
        let expr = match CronExpr::parse(&schedule.spec.schedule) {
            Ok(expr) => expr,
            Err(e) => {
                warn!(schedule = %schedule.spec.schedule, error = %e, "Unparseable schedule");
                self.recorder.warning(
                    key,
                    Reason::InvalidSchedule,
                    format!("Unparseable schedule '{}': {e}", schedule.spec.schedule),
                );
                return None;
            }
        };

        let starting_deadline = match schedule.starting_deadline() {
            Ok(deadline) => deadline,
            Err(e) => {
                warn!(error = %e, "Invalid starting deadline");
                self.recorder
                    .warning(key, Reason::InvalidSchedule, e.to_string());
                return None;
            }
        };

        let last_scheduled = schedule
            .status
            .last_schedule_time
            .unwrap_or(schedule.metadata.creation_timestamp);

        match self
            .config
            .next_schedule(&expr, last_scheduled, starting_deadline, now)
        {
            Ok(decision) => Some((decision, starting_deadline)),
            Err(e @ ScheduleError::TooManyMissed { .. }) => {
                warn!(error = %e, "Too many missed runs");
                self.recorder
                    .warning(key, Reason::TooManyMissedRuns, e.to_string());
                None
            }
            Err(e @ ScheduleError::Unsatisfiable(_)) => {
                warn!(error = %e, "Schedule never fires");
                self.recorder
                    .warning(key, Reason::InvalidSchedule, e.to_string());
                None
            }
        }
    }
}

#[async_trait]
impl Reconcile for CronScheduleReconciler {
    #[instrument(skip(self), fields(key = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(schedule) = self.cache.schedule(key) else {
            debug!("Schedule not found, nothing to do");
            return Ok(Action::Done);
        };

        let children = self.children_of(&schedule);
        let observed = Observed::from_children(&children);
        debug!(
            active = observed.active.len(),
            succeeded = observed.succeeded.len(),
            failed = observed.failed.len(),
            "Observed children"
        );

        let schedule = self.update_status(key, &schedule, &observed).await?;
        self.prune_history(key, &schedule, &observed).await;

        if schedule.spec.suspend {
            debug!("Schedule suspended");
            return Ok(Action::Done);
        }

        let now = self.clock.now();
        let Some((decision, starting_deadline)) = self.decide(key, &schedule, now) else {
            return Ok(Action::Done);
        };
        let wait = Action::RequeueAfter(decision.wait_from(now));

        let Some(missed) = decision.missed else {
            debug!(next = %decision.next, "No missed run");
            return Ok(wait);
        };

        if let Some(deadline) = starting_deadline {
            if missed
                .checked_add_signed(deadline)
                .is_some_and(|expires| expires < now)
            {
                debug!(missed = %missed, "Missed starting deadline");
                self.recorder.warning(
                    key,
                    Reason::MissSchedule,
                    format!("Missed scheduled time {missed} past the starting deadline"),
                );
                return Ok(wait);
            }
        }

        match schedule.spec.concurrency_policy {
            ConcurrencyPolicy::Forbid if !observed.active.is_empty() => {
                debug!(active = observed.active.len(), "Concurrency policy forbids launch");
                self.recorder.normal(
                    key,
                    Reason::JobAlreadyActive,
                    format!(
                        "Not starting run for {missed}: {} work item(s) still active",
                        observed.active.len()
                    ),
                );
                return Ok(wait);
            }
            ConcurrencyPolicy::Replace => {
                for item in &observed.active {
                    self.delete_child(key, item, "replaced").await;
                }
            }
            ConcurrencyPolicy::Allow | ConcurrencyPolicy::Forbid => {}
        }

        let item = match WorkItem::from_template(&schedule, missed) {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "Invalid work item template");
                self.recorder
                    .warning(key, Reason::InvalidTemplate, e.to_string());
                return Ok(Action::Done);
            }
        };

        let name = item.metadata.name.clone();
        match self.store.create_work_item(item).await {
            Ok(_) => {
                info!(child = %name, scheduled = %missed, "Launched work item");
                self.recorder.normal(
                    key,
                    Reason::SuccessfulCreate,
                    format!("Created work item {name}"),
                );
            }
            Err(e) if e.is_already_exists() => {
                debug!(child = %name, "Work item already launched");
            }
            Err(e) => {
                self.recorder.warning(
                    key,
                    Reason::FailedCreate,
                    format!("Failed to create work item {name}: {e}"),
                );
                return Err(e.into());
            }
        }

        Ok(wait)
    }
}
