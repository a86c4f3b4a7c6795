//! # cadence-id
//!
//! Stable identity types for objects held in the cadence store.
//!
//! ## Design Principles
//!
//! - Names are user-controlled labels; UIDs are system-generated and never reused
//! - A name can be reused after deletion, a UID cannot, so ownership is
//!   always checked against the UID
//! - All identity types have a canonical string representation with strict parsing
//!
//! ## Formats
//!
//! - Object keys: `{namespace}/{name}`, e.g. `default/nightly-backup`
//! - UIDs: `uid_{ulid}`, e.g. `uid_01HV4Z2WQXKJNM8GPQY6VBKC3D`

mod error;
mod key;
mod macros;
mod types;

pub use error::IdError;
pub use key::{validate_name, ObjectKey, MAX_NAME_LEN};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
