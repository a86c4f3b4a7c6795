//! Explicit kind registry.
//!
//! A [`Scheme`] maps kind names to decode, encode and defaulting functions.
//! It is built once at startup and passed by reference; there is no
//! process-wide registry.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::ApiError;
use crate::object::{Kind, Object};
use crate::schedule::CronSchedule;
use crate::work_item::WorkItem;
use crate::API_VERSION;

type DecodeFn = fn(Value) -> Result<Object, ApiError>;
type EncodeFn = fn(&Object) -> Result<Value, ApiError>;
type DefaultFn = fn(&mut Object);

#[derive(Clone, Copy)]
struct KindEntry {
    decode: DecodeFn,
    encode: EncodeFn,
    default: DefaultFn,
}

/// Registry of the kinds a process understands.
#[derive(Clone, Default)]
pub struct Scheme {
    kinds: BTreeMap<Kind, KindEntry>,
}

impl std::fmt::Debug for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheme")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Scheme {
    /// An empty scheme.
    pub fn new() -> Self {
        Self::default()
    }

    /// A scheme with every built-in kind registered.
    pub fn with_defaults() -> Self {
        let mut scheme = Self::new();
        // Both kinds are distinct, so registration cannot collide.
        let _ = scheme.register(Kind::CronSchedule, decode_schedule, encode_schedule, default_schedule);
        let _ = scheme.register(Kind::WorkItem, decode_work_item, encode_work_item, no_defaults);
        scheme
    }

    /// Registers a kind. Fails if it is already present.
    pub fn register(
        &mut self,
        kind: Kind,
        decode: DecodeFn,
        encode: EncodeFn,
        default: DefaultFn,
    ) -> Result<(), ApiError> {
        if self.kinds.contains_key(&kind) {
            return Err(ApiError::DuplicateKind(kind.to_string()));
        }
        self.kinds.insert(
            kind,
            KindEntry {
                decode,
                encode,
                default,
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, kind: Kind) -> bool {
        self.kinds.contains_key(&kind)
    }

    /// Decodes a manifest, dispatching on its `kind` field, and applies
    /// defaults.
    pub fn decode(&self, manifest: Value) -> Result<Object, ApiError> {
        let kind_name = manifest
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(ApiError::MissingKind)?;
        let kind: Kind = kind_name.parse()?;
        let entry = self.entry(kind)?;

        let mut object = (entry.decode)(manifest)?;
        let key = object.key();
        cadence_id::ObjectKey::new(key.namespace, key.name)?;
        (entry.default)(&mut object);
        Ok(object)
    }

    /// Encodes an object as a manifest carrying `apiVersion` and `kind`.
    pub fn encode(&self, object: &Object) -> Result<Value, ApiError> {
        let entry = self.entry(object.kind())?;
        let mut value = (entry.encode)(object)?;
        if let Value::Object(map) = &mut value {
            map.insert("apiVersion".to_string(), Value::from(API_VERSION));
            map.insert("kind".to_string(), Value::from(object.kind().as_str()));
        }
        Ok(value)
    }

    /// Applies the registered defaulting function in place.
    pub fn default_object(&self, object: &mut Object) -> Result<(), ApiError> {
        let entry = self.entry(object.kind())?;
        (entry.default)(object);
        Ok(())
    }

    fn entry(&self, kind: Kind) -> Result<&KindEntry, ApiError> {
        self.kinds
            .get(&kind)
            .ok_or_else(|| ApiError::UnknownKind(kind.to_string()))
    }
}

fn strip_type_fields(mut manifest: Value) -> Value {
    if let Value::Object(map) = &mut manifest {
        map.remove("kind");
        map.remove("apiVersion");
    }
    manifest
}

fn invalid(kind: Kind, err: serde_json::Error) -> ApiError {
    ApiError::InvalidManifest {
        kind: kind.to_string(),
        message: err.to_string(),
    }
}

fn decode_schedule(manifest: Value) -> Result<Object, ApiError> {
    let schedule: CronSchedule = serde_json::from_value(strip_type_fields(manifest))
        .map_err(|e| invalid(Kind::CronSchedule, e))?;
    schedule.validate()?;
    Ok(Object::CronSchedule(schedule))
}

fn encode_schedule(object: &Object) -> Result<Value, ApiError> {
    match object {
        Object::CronSchedule(s) => Ok(serde_json::to_value(s)?),
        other => Err(ApiError::UnknownKind(other.kind().to_string())),
    }
}

fn default_schedule(object: &mut Object) {
    if let Object::CronSchedule(s) = object {
        s.apply_defaults();
    }
}

fn decode_work_item(manifest: Value) -> Result<Object, ApiError> {
    let item: WorkItem = serde_json::from_value(strip_type_fields(manifest))
        .map_err(|e| invalid(Kind::WorkItem, e))?;
    Ok(Object::WorkItem(item))
}

fn encode_work_item(object: &Object) -> Result<Value, ApiError> {
    match object {
        Object::WorkItem(w) => Ok(serde_json::to_value(w)?),
        other => Err(ApiError::UnknownKind(other.kind().to_string())),
    }
}

fn no_defaults(_object: &mut Object) {}
