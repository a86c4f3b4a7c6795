//! Controller error types.

use thiserror::Error;

use crate::store::StoreError;

/// Retryable failure of one reconcile pass.
///
/// Non-retryable outcomes (bad schedule, bad template, too many missed runs)
/// are not errors: the reconciler records them and finishes the pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A store read or write failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The reconciler panicked; the worker recovered.
    #[error("reconciler panicked: {0}")]
    Panicked(String),
}

/// Errors that stop the controller as a whole.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The cache did not finish its initial listing in time.
    #[error("timed out waiting for cache to sync")]
    CacheSyncTimeout,
}
