//! Store adapter interface.
//!
//! The controller never talks to a concrete backend directly; it goes
//! through [`Store`], which offers typed CRUD, optimistic concurrency via
//! resource versions, and a resumable watch stream.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use cadence_api::{CronSchedule, Object, WatchEvent, WorkItem};
use cadence_id::ObjectKey;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Store operation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },

    /// An object with the same name already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },

    /// The caller's resource version is stale.
    #[error("conflict on {kind} {key}: expected version {expected}, found {actual}")]
    Conflict {
        kind: String,
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    /// Transient failure; retry later.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The request was rejected as malformed.
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// What happens to dependents when an object is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Propagation {
    /// Delete the object now and its dependents afterwards.
    #[default]
    Background,

    /// Delete only the object; dependents lose their owner reference.
    Orphan,
}

/// A consistent listing of every object, with the version to watch from.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub objects: Vec<Object>,
    pub resource_version: u64,
}

/// Typed access to the backing object store.
#[async_trait]
pub trait Store: Send + Sync {
    /// List every object.
    async fn list(&self) -> StoreResult<Snapshot>;

    /// Stream changes with a resource version greater than `from_version`.
    ///
    /// The stream ends when the store can no longer continue it; callers
    /// re-list and watch again.
    async fn watch(&self, from_version: u64) -> StoreResult<BoxStream<'static, WatchEvent>>;

    async fn get_schedule(&self, key: &ObjectKey) -> StoreResult<CronSchedule>;

    async fn create_schedule(&self, schedule: CronSchedule) -> StoreResult<CronSchedule>;

    /// Replace metadata labels/annotations and spec. Status is left untouched.
    async fn update_schedule(&self, schedule: CronSchedule) -> StoreResult<CronSchedule>;

    /// Replace status. Fails with `Conflict` on a stale resource version.
    async fn update_schedule_status(&self, schedule: &CronSchedule) -> StoreResult<CronSchedule>;

    async fn delete_schedule(&self, key: &ObjectKey, propagation: Propagation) -> StoreResult<()>;

    /// Create a work item. Fails with `AlreadyExists` on a name collision.
    async fn create_work_item(&self, item: WorkItem) -> StoreResult<WorkItem>;

    /// Replace status. Fails with `Conflict` on a stale resource version.
    async fn update_work_item_status(&self, item: &WorkItem) -> StoreResult<WorkItem>;

    async fn delete_work_item(&self, key: &ObjectKey, propagation: Propagation) -> StoreResult<()>;
}
