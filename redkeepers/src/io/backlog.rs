//! Backlog documents: active, completed, blocked, and the blocked archive.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::queue::Queue;
use crate::core::types::{ItemStatus, WorkItem};
use crate::core::validators::validate_collection;
use crate::io::paths::CoordinationPaths;
use crate::io::store::{load_document, save_document};

fn load_collection(paths: &CoordinationPaths, path: &Path, expected: Option<ItemStatus>) -> Result<Vec<WorkItem>> {
    let values: Vec<Value> = load_document(path, Vec::new())?;
    let errors = validate_collection(&paths.relative(path), &values, expected);
    if !errors.is_empty() {
        bail!("invalid backlog:\n- {}", errors.join("\n- "));
    }
    values
        .into_iter()
        .map(serde_json::from_value)
        .collect::<Result<Vec<WorkItem>, _>>()
        .with_context(|| format!("interpret {}", path.display()))
}

/// Load and validate the three backlog collections. Missing files are empty.
#[instrument(skip_all)]
pub fn load_queue(paths: &CoordinationPaths) -> Result<Queue> {
    let queue = Queue::new(
        load_collection(paths, &paths.work_items, None)?,
        load_collection(paths, &paths.completed_items, Some(ItemStatus::Completed))?,
        load_collection(paths, &paths.blocked_items, Some(ItemStatus::Blocked))?,
    );
    debug!(
        active = queue.active.len(),
        completed = queue.completed.len(),
        blocked = queue.blocked.len(),
        "backlog loaded"
    );
    Ok(queue)
}

pub fn save_queue(paths: &CoordinationPaths, queue: &Queue) -> Result<()> {
    save_document(&paths.work_items, &queue.active)?;
    save_document(&paths.completed_items, &queue.completed)?;
    save_document(&paths.blocked_items, &queue.blocked)?;
    Ok(())
}

/// Append records to `blocked-archived-items.json`.
pub fn append_archived(paths: &CoordinationPaths, records: &[Value]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut archive: Vec<Value> = load_document(&paths.blocked_archived_items, Vec::new())?;
    archive.extend_from_slice(records);
    save_document(&paths.blocked_archived_items, &archive)
}

pub fn load_archived(paths: &CoordinationPaths) -> Result<Vec<Value>> {
    load_document(&paths.blocked_archived_items, Vec::new())
}
