//! The declared recurring unit of work and its observed status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::meta::{ObjectMeta, ObjectReference, OwnerReference};
use crate::work_item::CHILD_NAME_SUFFIX_LEN;

/// Successful children retained when a manifest leaves the limit unset.
pub const DEFAULT_SUCCESSFUL_HISTORY_LIMIT: u32 = 3;

/// Failed children retained when a manifest leaves the limit unset.
pub const DEFAULT_FAILED_HISTORY_LIMIT: u32 = 1;

/// Longest schedule name whose child names still pass name validation.
pub const MAX_SCHEDULE_NAME_LEN: usize = cadence_id::MAX_NAME_LEN - CHILD_NAME_SUFFIX_LEN;

/// Whether a new launch may proceed while a previous one is still active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConcurrencyPolicy {
    /// Launch regardless of active children.
    #[default]
    Allow,
    /// Skip the launch while any child is active.
    Forbid,
    /// Delete active children, then launch.
    Replace,
}

impl std::fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConcurrencyPolicy::Allow => write!(f, "Allow"),
            ConcurrencyPolicy::Forbid => write!(f, "Forbid"),
            ConcurrencyPolicy::Replace => write!(f, "Replace"),
        }
    }
}

/// Describes the work item launched on each fire.
///
/// `spec` is opaque to the controller and copied verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemTemplate {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub spec: serde_json::Value,
}

/// Declared state of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronScheduleSpec {
    /// Cron expression, optionally prefixed with `CRON_TZ=<zone>`.
    pub schedule: String,

    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,

    #[serde(default)]
    pub suspend: bool,

    /// Missed runs older than this many seconds are abandoned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_history_limit: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_history_limit: Option<u32>,

    pub template: WorkItemTemplate,
}

/// Observed state of a schedule. Written only by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronScheduleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active: Vec<ObjectReference>,
}

/// A recurring unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronSchedule {
    pub metadata: ObjectMeta,
    pub spec: CronScheduleSpec,
    #[serde(default)]
    pub status: CronScheduleStatus,
}

impl CronSchedule {
    pub const KIND: &'static str = "CronSchedule";

    /// Creates a schedule with default policy and an empty template.
    pub fn new(metadata: ObjectMeta, schedule: impl Into<String>) -> Self {
        Self {
            metadata,
            spec: CronScheduleSpec {
                schedule: schedule.into(),
                concurrency_policy: ConcurrencyPolicy::default(),
                suspend: false,
                starting_deadline_seconds: None,
                successful_history_limit: None,
                failed_history_limit: None,
                template: WorkItemTemplate {
                    labels: BTreeMap::new(),
                    annotations: BTreeMap::new(),
                    spec: serde_json::json!({}),
                },
            },
            status: CronScheduleStatus::default(),
        }
    }

    /// The configured starting deadline, if any.
    ///
    /// Fails for negative values and for values chrono cannot represent.
    pub fn starting_deadline(&self) -> Result<Option<chrono::Duration>, ApiError> {
        let Some(secs) = self.spec.starting_deadline_seconds else {
            return Ok(None);
        };
        let invalid = |message: String| ApiError::InvalidField {
            field: "startingDeadlineSeconds".to_string(),
            message,
        };
        if secs < 0 {
            return Err(invalid(format!("must not be negative, got {secs}")));
        }
        chrono::Duration::try_seconds(secs)
            .map(Some)
            .ok_or_else(|| invalid(format!("{secs} is out of range")))
    }

    /// Checks that every child name derived from this schedule is valid.
    pub fn validate_name(&self) -> Result<(), ApiError> {
        let len = self.metadata.name.len();
        if len > MAX_SCHEDULE_NAME_LEN {
            return Err(ApiError::InvalidField {
                field: "metadata.name".to_string(),
                message: format!(
                    "schedule names are limited to {MAX_SCHEDULE_NAME_LEN} characters, got {len}"
                ),
            });
        }
        Ok(())
    }

    /// Admission checks for fields serde cannot constrain.
    pub fn validate(&self) -> Result<(), ApiError> {
        self.validate_name()?;
        self.starting_deadline()?;
        Ok(())
    }

    /// Owner reference to stamp on launched children.
    pub fn controller_reference(&self) -> OwnerReference {
        OwnerReference {
            kind: Self::KIND.to_string(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid,
            controller: true,
        }
    }

    /// Fills in fields the operator left unset.
    pub fn apply_defaults(&mut self) {
        if self.spec.successful_history_limit.is_none() {
            self.spec.successful_history_limit = Some(DEFAULT_SUCCESSFUL_HISTORY_LIMIT);
        }
        if self.spec.failed_history_limit.is_none() {
            self.spec.failed_history_limit = Some(DEFAULT_FAILED_HISTORY_LIMIT);
        }
    }
}
