//! Manifest loading.
//!
//! A manifest directory holds `*.json` files, each containing one object or
//! an array of objects. Files are read in name order so seeding is
//! reproducible.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cadence_api::{Object, Scheme};
use serde_json::Value;
use tracing::{debug, info};

use crate::store::Store;

/// Decodes every manifest under `dir` through `scheme`.
pub fn load_dir(dir: &Path, scheme: &Scheme) -> Result<Vec<Object>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read manifest dir {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("failed to list manifest dir {}", dir.display()))?;
    paths.retain(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"));
    paths.sort();

    let mut objects = Vec::new();
    for path in paths {
        let loaded = load_file(&path, scheme)?;
        debug!(path = %path.display(), count = loaded.len(), "Loaded manifest file");
        objects.extend(loaded);
    }
    Ok(objects)
}

fn load_file(path: &Path, scheme: &Scheme) -> Result<Vec<Object>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))?;

    let manifests = match value {
        Value::Array(items) => items,
        single => vec![single],
    };

    manifests
        .into_iter()
        .enumerate()
        .map(|(i, manifest)| {
            scheme
                .decode(manifest)
                .with_context(|| format!("invalid manifest #{i} in {}", path.display()))
        })
        .collect()
}

/// Creates `objects` in the store, schedules before work items.
///
/// Work items reference their owner by UID, which only exists once the owner
/// has been created, so seeded work items are created unowned.
pub async fn seed(store: &dyn Store, objects: Vec<Object>) -> Result<usize> {
    let (schedules, items): (Vec<_>, Vec<_>) = objects
        .into_iter()
        .partition(|o| matches!(o, Object::CronSchedule(_)));

    let mut created = 0;
    for object in schedules.into_iter().chain(items) {
        let key = object.key();
        match object {
            Object::CronSchedule(schedule) => {
                store
                    .create_schedule(schedule)
                    .await
                    .with_context(|| format!("failed to seed schedule {key}"))?;
            }
            Object::WorkItem(item) => {
                store
                    .create_work_item(item)
                    .await
                    .with_context(|| format!("failed to seed work item {key}"))?;
            }
        }
        created += 1;
    }

    info!(count = created, "Seeded store from manifests");
    Ok(created)
}
