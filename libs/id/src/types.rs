//! Typed ID definitions.
//!
//! Each ID type has a unique prefix that identifies what it names.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// Assigned by the store when an object is created.
define_id!(Uid, "uid");
