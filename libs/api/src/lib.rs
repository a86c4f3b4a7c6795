//! # cadence-api
//!
//! Object model for the cadence schedule controller.
//!
//! ## Design Principles
//!
//! - `spec` is declared by the operator and read-only to the controller
//!   (apart from defaulting of missing fields)
//! - `status` is owned by the controller and overwritten wholesale on every pass
//! - Children are bound to their owner by a controller owner reference and to
//!   the fire time they were launched for by the scheduled-at annotation
//!
//! ## Kinds
//!
//! - `CronSchedule`: the declared recurring unit of work
//! - `WorkItem`: one launched execution bound to a single scheduled time
//!
//! Kinds are decoded, encoded and defaulted through an explicit [`Scheme`]
//! built once at startup.

mod error;
mod meta;
mod object;
mod schedule;
mod scheme;
mod work_item;

pub use error::ApiError;
pub use meta::{ObjectMeta, ObjectReference, OwnerReference};
pub use object::{Kind, Object, WatchEvent, WatchEventType};
pub use schedule::{
    ConcurrencyPolicy, CronSchedule, CronScheduleSpec, CronScheduleStatus, WorkItemTemplate,
    DEFAULT_FAILED_HISTORY_LIMIT, DEFAULT_SUCCESSFUL_HISTORY_LIMIT, MAX_SCHEDULE_NAME_LEN,
};
pub use scheme::Scheme;
pub use work_item::{
    format_scheduled_time, parse_scheduled_time, Phase, WorkItem, WorkItemStatus,
    CHILD_NAME_SUFFIX_LEN, SCHEDULED_AT_ANNOTATION, SCHEDULE_NAME_LABEL,
};

/// API group/version stamped on encoded manifests.
pub const API_VERSION: &str = "cadence.dev/v1";
