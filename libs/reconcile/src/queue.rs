//! Deduplicating, rate-limited work queue.
//!
//! Semantics:
//!
//! - A key is queued at most once; adding a queued key is a no-op.
//! - A key handed out by [`WorkQueue::get`] is *processing* until
//!   [`WorkQueue::done`]. Adds during that window mark it dirty and it is
//!   re-queued exactly once on `done`, so two workers never hold the same key.
//! - Delayed adds keep only the earliest deadline per key.
//! - After [`WorkQueue::shut_down`], new adds are ignored, pending delayed
//!   adds are dropped and `get` returns `None` once the queue drains.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backoff::{BackoffPolicy, ItemBackoff};

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: HashMap<K, Instant>,
    backoff: ItemBackoff<K>,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> QueueState<K> {
    fn insert(&mut self, key: K) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        if self.waiting.is_empty() {
            return;
        }

        let mut due: Vec<(Instant, K)> = self
            .waiting
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*deadline, key.clone()))
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);

        for (_, key) in due {
            self.waiting.remove(&key);
            self.insert(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.values().min().copied()
    }
}

/// A work queue of keys shared by producers and workers.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    /// Creates a queue whose rate-limited adds follow `policy`.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                backoff: ItemBackoff::new(policy),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues `key` unless it is already queued.
    pub fn add(&self, key: K) {
        let inserted = self.state.lock().insert(key);
        if inserted {
            self.notify.notify_waiters();
        }
    }

    /// Enqueues `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            let entry = state.waiting.entry(key).or_insert(deadline);
            if deadline < *entry {
                *entry = deadline;
            }
        }
        // Wake sleepers so they re-arm on the new deadline.
        self.notify.notify_waiters();
    }

    /// Enqueues `key` after its per-key backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.state.lock().backoff.when(&key);
        self.add_after(key, delay);
    }

    /// Clears the backoff history of `key`.
    pub fn forget(&self, key: &K) {
        self.state.lock().backoff.forget(key);
    }

    /// Rate-limited adds of `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state.lock().backoff.num_requeues(key)
    }

    /// Waits for the next key. Returns `None` once shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock();
                state.promote_due(Instant::now());

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Marks the current processing attempt of `key` complete.
    pub fn done(&self, key: &K) {
        {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
            }
        }
        self.notify.notify_waiters();
    }

    /// Closes the queue. Workers drain what is queued, then `get` returns `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.notify.notify_waiters();
    }

    /// Closes the queue and waits until every queued and processing key is done.
    ///
    /// Never completes if nothing is calling `get`/`done`.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.queue.is_empty() && state.processing.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}
