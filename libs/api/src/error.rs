//! Error types for object decoding and validation.

use thiserror::Error;

/// Errors that can occur when handling API objects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The manifest names a kind the scheme does not know.
    #[error("unknown kind: {0}")]
    UnknownKind(String),

    /// The manifest has no `kind` field.
    #[error("manifest is missing the 'kind' field")]
    MissingKind,

    /// The kind is already registered.
    #[error("kind already registered: {0}")]
    DuplicateKind(String),

    /// The payload does not match the kind's schema.
    #[error("invalid {kind} manifest: {message}")]
    InvalidManifest { kind: String, message: String },

    /// A spec field holds a value the controller cannot act on.
    #[error("invalid {field}: {message}")]
    InvalidField { field: String, message: String },

    /// The object's identity is invalid.
    #[error("invalid object identity: {0}")]
    InvalidIdentity(#[from] cadence_id::IdError),

    /// The scheduled-at annotation is missing.
    #[error("scheduled time annotation not found")]
    ScheduledTimeNotFound,

    /// The scheduled-at annotation cannot be parsed.
    #[error("invalid scheduled time annotation '{value}': {message}")]
    InvalidScheduledTime { value: String, message: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Serialization(err.to_string())
    }
}
