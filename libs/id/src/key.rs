//! Namespaced object keys.
//!
//! A key is the `{namespace}/{name}` pair that identifies an object in the
//! store and in the work queue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::IdError;

/// Maximum length of a namespace or object name.
pub const MAX_NAME_LEN: usize = 253;

/// Validates a namespace or object name.
///
/// Names are lowercase ASCII alphanumerics, `-` and `.`, and must start and
/// end with an alphanumeric character.
pub fn validate_name(name: &str) -> Result<(), IdError> {
    let invalid = |reason| IdError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(IdError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 253 characters"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
    {
        return Err(invalid("only lowercase alphanumerics, '-' and '.' are allowed"));
    }

    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = name.as_bytes();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return Err(invalid("must start and end with an alphanumeric character"));
    }

    Ok(())
}

/// Identifies an object by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Builds a key, validating both parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        let key = Self {
            namespace: namespace.into(),
            name: name.into(),
        };
        validate_name(&key.namespace)?;
        validate_name(&key.name)?;
        Ok(key)
    }

    /// Parses the `{namespace}/{name}` form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((namespace, name)) = s.split_once('/') else {
            return Err(IdError::MissingSeparator('/'));
        };

        if name.contains('/') {
            return Err(IdError::InvalidFormat {
                message: format!("unexpected extra '/' in key '{s}'"),
            });
        }

        Self::new(namespace, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
