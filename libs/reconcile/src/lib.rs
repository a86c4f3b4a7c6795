//! Reconciliation loop primitives.
//!
//! This library provides the in-process building blocks of a level-triggered
//! controller:
//!
//! - **Clock**: injected time source, wall-clock or fake.
//! - **Cron / Schedule Engine**: parse cron expressions and compute the
//!   latest missed fire and the next fire from time bookkeeping.
//! - **History**: bucket children by phase and pick the oldest excess.
//! - **Work Queue**: deduplicating FIFO with per-key backoff and delayed adds.
//!
//! # Invariants
//!
//! - Schedule decisions are deterministic given the same inputs
//! - At most one processing attempt per key is in flight
//! - Backoff delays are capped

mod backoff;
mod clock;
mod cron;
mod history;
mod queue;
mod schedule;

use std::time::Duration;

pub use backoff::{BackoffPolicy, ItemBackoff, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};
pub use clock::{Clock, FakeClock, SystemClock};
pub use cron::{CronExpr, CronField, CronParseError};
pub use history::{partition_by_phase, partition_work_items, select_for_pruning, Partition};
pub use queue::WorkQueue;
pub use schedule::{
    next_schedule, ScheduleConfig, ScheduleDecision, ScheduleError, DEFAULT_MISSED_RUN_CAP,
};

/// What a successful reconcile pass asks of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged; wait for the next external event.
    Done,

    /// Reconcile this key again after the delay.
    RequeueAfter(Duration),
}

impl Action {
    /// The requested delay, if any.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Action::Done => None,
            Action::RequeueAfter(delay) => Some(*delay),
        }
    }
}

/// Default period between full cache resyncs.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);
