//! cadence controller library.
//!
//! This crate ships the `cadence-controller` binary, but exposes its pieces
//! as a library so integration tests can assemble a controller against the
//! in-memory store.

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod manifests;
pub mod reconciler;
pub mod recorder;
pub mod store;
