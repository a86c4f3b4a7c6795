//! Work item classification and history pruning selection.

use cadence_api::{Phase, WorkItem};
use chrono::{DateTime, Utc};

/// Children of one owner, bucketed by phase.
#[derive(Debug, Clone)]
pub struct Partition<T> {
    /// Pending or running.
    pub active: Vec<T>,
    pub succeeded: Vec<T>,
    pub failed: Vec<T>,
}

/// Splits items into active, succeeded and failed buckets.
pub fn partition_by_phase<I, F>(items: I, get_phase: F) -> Partition<I::Item>
where
    I: IntoIterator,
    F: Fn(&I::Item) -> Phase,
{
    let mut partition = Partition {
        active: Vec::new(),
        succeeded: Vec::new(),
        failed: Vec::new(),
    };

    for item in items {
        match get_phase(&item) {
            Phase::Pending | Phase::Running => partition.active.push(item),
            Phase::Succeeded => partition.succeeded.push(item),
            Phase::Failed => partition.failed.push(item),
        }
    }

    partition
}

/// Convenience wrapper over [`partition_by_phase`] for work items.
pub fn partition_work_items<'a, I>(items: I) -> Partition<&'a WorkItem>
where
    I: IntoIterator<Item = &'a WorkItem>,
{
    partition_by_phase(items, |item| item.phase())
}

/// Selects the items to delete so that at most `limit` remain.
///
/// Items are ordered by start time, oldest first; items without a start
/// time sort before all others. Returns the oldest excess, oldest first.
pub fn select_for_pruning<T, F>(mut items: Vec<T>, limit: usize, get_start: F) -> Vec<T>
where
    F: Fn(&T) -> Option<DateTime<Utc>>,
{
    if items.len() <= limit {
        return Vec::new();
    }

    // `None < Some(_)`, so unstarted items come first.
    items.sort_by_key(get_start);
    let excess = items.len() - limit;
    items.truncate(excess);
    items
}
