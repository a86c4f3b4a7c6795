//! Error types for identity parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing its separator.
    #[error("missing '{0}' separator")]
    MissingSeparator(char),

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// An object name does not satisfy the naming rules.
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The key format is invalid.
    #[error("invalid key format: {message}")]
    InvalidFormat { message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
