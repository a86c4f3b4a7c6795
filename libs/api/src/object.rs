//! Tagged union over every kind the store holds, and the watch event envelope.

use std::fmt;
use std::str::FromStr;

use cadence_id::ObjectKey;

use crate::error::ApiError;
use crate::meta::ObjectMeta;
use crate::schedule::CronSchedule;
use crate::work_item::WorkItem;

/// Object kinds known to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    CronSchedule,
    WorkItem,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::CronSchedule => CronSchedule::KIND,
            Kind::WorkItem => WorkItem::KIND,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            CronSchedule::KIND => Ok(Kind::CronSchedule),
            WorkItem::KIND => Ok(Kind::WorkItem),
            other => Err(ApiError::UnknownKind(other.to_string())),
        }
    }
}

/// A strongly-typed stored object.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    CronSchedule(CronSchedule),
    WorkItem(WorkItem),
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Object::CronSchedule(_) => Kind::CronSchedule,
            Object::WorkItem(_) => Kind::WorkItem,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Object::CronSchedule(s) => &s.metadata,
            Object::WorkItem(w) => &w.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Object::CronSchedule(s) => &mut s.metadata,
            Object::WorkItem(w) => &mut w.metadata,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata().key()
    }

    pub fn resource_version(&self) -> u64 {
        self.metadata().resource_version
    }

    pub fn as_schedule(&self) -> Option<&CronSchedule> {
        match self {
            Object::CronSchedule(s) => Some(s),
            Object::WorkItem(_) => None,
        }
    }

    pub fn as_work_item(&self) -> Option<&WorkItem> {
        match self {
            Object::WorkItem(w) => Some(w),
            Object::CronSchedule(_) => None,
        }
    }
}

impl From<CronSchedule> for Object {
    fn from(s: CronSchedule) -> Self {
        Object::CronSchedule(s)
    }
}

impl From<WorkItem> for Object {
    fn from(w: WorkItem) -> Self {
        Object::WorkItem(w)
    }
}

/// A change observed on the store's watch stream.
///
/// `Deleted` carries the object's last state as seen by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
}

impl WatchEvent {
    pub fn object(&self) -> &Object {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }

    /// Resource version the store assigned to this change.
    pub fn resource_version(&self) -> u64 {
        self.object().resource_version()
    }

    pub fn event_type(&self) -> WatchEventType {
        match self {
            WatchEvent::Added(_) => WatchEventType::Added,
            WatchEvent::Modified(_) => WatchEventType::Modified,
            WatchEvent::Deleted(_) => WatchEventType::Deleted,
        }
    }
}

/// Discriminant of a [`WatchEvent`], for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchEventType::Added => write!(f, "added"),
            WatchEventType::Modified => write!(f, "modified"),
            WatchEventType::Deleted => write!(f, "deleted"),
        }
    }
}
