//! Launched units of work.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::meta::{ObjectMeta, ObjectReference};
use crate::schedule::CronSchedule;

/// Annotation recording the fire time a work item was launched for.
///
/// This is the dedup key for launches: it is written once at creation and
/// never re-derived from the name or timestamps.
pub const SCHEDULED_AT_ANNOTATION: &str = "cadence.dev/scheduled-at";

/// Label carrying the owning schedule's name.
pub const SCHEDULE_NAME_LABEL: &str = "cadence.dev/schedule-name";

/// Length of the `-<unix seconds>` suffix appended to child names, for fire
/// times before the year 2286.
pub const CHILD_NAME_SUFFIX_LEN: usize = 11;

/// Lifecycle phase of a work item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Phase {
    /// Succeeded and Failed are terminal; a work item never leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Observed state of a work item, written by the executing backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemStatus {
    #[serde(default)]
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

/// One concrete execution launched for a single scheduled time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: serde_json::Value,

    #[serde(default)]
    pub status: WorkItemStatus,
}

impl WorkItem {
    pub const KIND: &'static str = "WorkItem";

    /// Deterministic child name for a (schedule, fire time) pair.
    pub fn child_name(schedule_name: &str, scheduled: DateTime<Utc>) -> String {
        format!("{}-{}", schedule_name, scheduled.timestamp())
    }

    /// Builds the child for `scheduled` from the schedule's template.
    ///
    /// Fails when the template has no spec or the derived name is invalid.
    pub fn from_template(
        schedule: &CronSchedule,
        scheduled: DateTime<Utc>,
    ) -> Result<Self, ApiError> {
        let template = &schedule.spec.template;
        if template.spec.is_null() {
            return Err(ApiError::InvalidManifest {
                kind: CronSchedule::KIND.to_string(),
                message: "template.spec is required".to_string(),
            });
        }

        let name = Self::child_name(&schedule.metadata.name, scheduled);
        cadence_id::validate_name(&name)?;

        let mut metadata = ObjectMeta::new(schedule.metadata.namespace.clone(), name);
        metadata.labels = template.labels.clone();
        metadata
            .labels
            .insert(SCHEDULE_NAME_LABEL.to_string(), schedule.metadata.name.clone());
        metadata.annotations = template.annotations.clone();
        metadata.annotations.insert(
            SCHEDULED_AT_ANNOTATION.to_string(),
            format_scheduled_time(scheduled),
        );
        metadata
            .owner_references
            .push(schedule.controller_reference());

        Ok(Self {
            metadata,
            spec: template.spec.clone(),
            status: WorkItemStatus::default(),
        })
    }

    /// The fire time recorded on this work item at launch.
    pub fn scheduled_time(&self) -> Result<DateTime<Utc>, ApiError> {
        let value = self
            .metadata
            .annotations
            .get(SCHEDULED_AT_ANNOTATION)
            .ok_or(ApiError::ScheduledTimeNotFound)?;
        parse_scheduled_time(value)
    }

    pub fn phase(&self) -> Phase {
        self.status.phase
    }

    /// Reference recorded in the owner's `status.active`.
    pub fn object_reference(&self) -> ObjectReference {
        ObjectReference {
            kind: Self::KIND.to_string(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid,
        }
    }
}

/// Formats a fire time for the scheduled-at annotation (RFC 3339, UTC).
pub fn format_scheduled_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses a scheduled-at annotation value.
pub fn parse_scheduled_time(value: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ApiError::InvalidScheduledTime {
            value: value.to_string(),
            message: e.to_string(),
        })
}
