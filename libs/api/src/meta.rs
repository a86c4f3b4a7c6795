//! Object metadata shared by every kind.

use std::collections::BTreeMap;

use cadence_id::{ObjectKey, Uid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard object metadata.
///
/// `uid`, `resource_version` and `creation_timestamp` are assigned by the
/// store on create; values supplied by clients are overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,

    #[serde(default)]
    pub uid: Uid,

    /// Store-assigned version used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Metadata for a new object; store-owned fields get placeholder values.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: Uid::new(),
            resource_version: 0,
            creation_timestamp: Utc::now(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner_references: Vec::new(),
        }
    }

    /// The object's store key.
    ///
    /// Not validated; use [`ObjectKey::new`] where the parts come from
    /// untrusted input.
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Returns the owner reference flagged as the managing controller.
    pub fn controller_of(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    /// True if `owner` is this object's controller.
    ///
    /// Matches on UID, so a re-created owner with the same name does not
    /// adopt children of its predecessor.
    pub fn is_controlled_by(&self, owner: &ObjectMeta) -> bool {
        self.controller_of()
            .is_some_and(|r| r.uid == owner.uid && self.namespace == owner.namespace)
    }
}

/// Reference from a child to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: Uid,

    /// Only one owner reference per object may be the controller.
    #[serde(default)]
    pub controller: bool,
}

/// Reference to an object, as recorded in status fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: Uid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_matches_uid_not_name() {
        let owner = ObjectMeta::new("default", "nightly");
        let mut child = ObjectMeta::new("default", "nightly-1");
        child.owner_references.push(OwnerReference {
            kind: "CronSchedule".to_string(),
            name: owner.name.clone(),
            uid: owner.uid,
            controller: true,
        });
        assert!(child.is_controlled_by(&owner));

        // Same name, new identity.
        let recreated = ObjectMeta::new("default", "nightly");
        assert!(!child.is_controlled_by(&recreated));
    }

    #[test]
    fn test_non_controller_reference_is_ignored() {
        let owner = ObjectMeta::new("default", "nightly");
        let mut child = ObjectMeta::new("default", "nightly-1");
        child.owner_references.push(OwnerReference {
            kind: "CronSchedule".to_string(),
            name: owner.name.clone(),
            uid: owner.uid,
            controller: false,
        });
        assert!(child.controller_of().is_none());
        assert!(!child.is_controlled_by(&owner));
    }
}
