//! Simulated execution backend.
//!
//! Stands in for whatever actually runs work items. It polls the store and
//! moves each item `Pending -> Running -> Succeeded`, completing it once it
//! has been running for the configured runtime.

use std::sync::Arc;
use std::time::Duration;

use cadence_api::{Phase, WorkItem};
use cadence_reconcile::Clock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::{Store, StoreResult};

/// Default poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Mock executor driving work item phases.
pub struct Executor {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    runtime: chrono::Duration,
    poll_interval: Duration,
}

impl Executor {
    /// Create an executor that completes items after `runtime`.
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, runtime: Duration) -> Self {
        Self {
            store,
            clock,
            runtime: chrono::Duration::from_std(runtime).unwrap_or(chrono::Duration::MAX),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            runtime_secs = self.runtime.num_seconds(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "[MOCK] Executor started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.step().await {
                        warn!(error = %e, "[MOCK] Executor pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("[MOCK] Executor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over every work item. Returns the number of transitions.
    pub async fn step(&self) -> StoreResult<usize> {
        let snapshot = self.store.list().await?;
        let now = self.clock.now();
        let mut transitions = 0;

        for object in snapshot.objects {
            let Some(item) = object.as_work_item() else {
                continue;
            };
            let Some(next) = self.advance(item, now) else {
                continue;
            };

            match self.store.update_work_item_status(&next).await {
                Ok(written) => {
                    transitions += 1;
                    info!(
                        item = %written.metadata.key(),
                        phase = %written.phase(),
                        "[MOCK] Work item transitioned"
                    );
                }
                // Changed or deleted under us; the next pass sees the new state.
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!(item = %item.metadata.key(), error = %e, "[MOCK] Skipping transition");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(transitions)
    }

    fn advance(&self, item: &WorkItem, now: chrono::DateTime<chrono::Utc>) -> Option<WorkItem> {
        let mut next = item.clone();
        match item.phase() {
            Phase::Pending => {
                next.status.phase = Phase::Running;
                next.status.start_time = Some(now);
            }
            Phase::Running => {
                let started = item.status.start_time.unwrap_or(now);
                let done = started.checked_add_signed(self.runtime);
                if done.is_none_or(|done| done > now) {
                    return None;
                }
                next.status.phase = Phase::Succeeded;
                next.status.completion_time = Some(now);
            }
            Phase::Succeeded | Phase::Failed => return None,
        }
        Some(next)
    }
}
