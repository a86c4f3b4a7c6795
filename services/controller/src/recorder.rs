//! Operator-visible events about schedules.

use std::fmt;

use cadence_id::ObjectKey;
use parking_lot::Mutex;
use tracing::{info, warn};

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Why an event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    SuccessfulCreate,
    SuccessfulDelete,
    SawCompletedJob,
    MissSchedule,
    JobAlreadyActive,
    InvalidSchedule,
    TooManyMissedRuns,
    InvalidTemplate,
    FailedCreate,
    FailedDelete,
    FailedUpdateStatus,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::SuccessfulCreate => "SuccessfulCreate",
            Reason::SuccessfulDelete => "SuccessfulDelete",
            Reason::SawCompletedJob => "SawCompletedJob",
            Reason::MissSchedule => "MissSchedule",
            Reason::JobAlreadyActive => "JobAlreadyActive",
            Reason::InvalidSchedule => "InvalidSchedule",
            Reason::TooManyMissedRuns => "TooManyMissedRuns",
            Reason::InvalidTemplate => "InvalidTemplate",
            Reason::FailedCreate => "FailedCreate",
            Reason::FailedDelete => "FailedDelete",
            Reason::FailedUpdateStatus => "FailedUpdateStatus",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub object: ObjectKey,
    pub event_type: EventType,
    pub reason: Reason,
    pub message: String,
}

/// Sink for operator-visible events.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);

    fn normal(&self, object: &ObjectKey, reason: Reason, message: String) {
        self.record(Event {
            object: object.clone(),
            event_type: EventType::Normal,
            reason,
            message,
        });
    }

    fn warning(&self, object: &ObjectKey, reason: Reason, message: String) {
        self.record(Event {
            object: object.clone(),
            event_type: EventType::Warning,
            reason,
            message,
        });
    }
}

/// Writes events to the log.
#[derive(Debug, Default)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                object = %event.object,
                reason = %event.reason,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                object = %event.object,
                reason = %event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Keeps events in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Number of events recorded with `reason`.
    pub fn count(&self, reason: Reason) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.reason == reason)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}
