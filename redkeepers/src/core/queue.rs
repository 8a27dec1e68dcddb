//! In-memory backlog: active, completed, and blocked collections.
//!
//! Every transition removes the id from all three collections before
//! appending it to the target, so an id lives in exactly one collection at
//! rest and repeated transitions are idempotent.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::core::types::{ItemStatus, Priority, WorkItem, auto_tag, blocker_category};

/// Errors from queue transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    UnknownItem(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::UnknownItem(id) => write!(f, "unknown work item '{id}'"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Which collection an item is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Active,
    Completed,
    Blocked,
}

/// The three backlog collections mirroring `coordination/backlog/*.json`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Queue {
    pub active: Vec<WorkItem>,
    pub completed: Vec<WorkItem>,
    pub blocked: Vec<WorkItem>,
}

impl Queue {
    pub fn new(active: Vec<WorkItem>, completed: Vec<WorkItem>, blocked: Vec<WorkItem>) -> Self {
        Self {
            active,
            completed,
            blocked,
        }
    }

    /// Latest copy of `id`, searching active, then blocked, then completed.
    pub fn find(&self, id: &str) -> Option<&WorkItem> {
        self.active
            .iter()
            .chain(self.blocked.iter())
            .chain(self.completed.iter())
            .rev()
            .find(|item| item.id == id)
    }

    pub fn location(&self, id: &str) -> Option<Collection> {
        if self.active.iter().any(|item| item.id == id) {
            Some(Collection::Active)
        } else if self.blocked.iter().any(|item| item.id == id) {
            Some(Collection::Blocked)
        } else if self.completed.iter().any(|item| item.id == id) {
            Some(Collection::Completed)
        } else {
            None
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.location(id).is_some()
    }

    pub fn completed_ids(&self) -> HashSet<&str> {
        self.completed.iter().map(|item| item.id.as_str()).collect()
    }

    pub fn blocked_ids(&self) -> HashSet<&str> {
        self.blocked.iter().map(|item| item.id.as_str()).collect()
    }

    /// True if every dependency of `item` is completed.
    pub fn dependencies_ready(&self, item: &WorkItem) -> bool {
        let completed = self.completed_ids();
        item.dependencies
            .iter()
            .all(|dep| completed.contains(dep.as_str()))
    }

    /// Active items that are queued with all dependencies completed.
    pub fn ready_items(&self) -> Vec<&WorkItem> {
        let completed = self.completed_ids();
        self.active
            .iter()
            .filter(|item| item.status == ItemStatus::Queued)
            .filter(|item| {
                item.dependencies
                    .iter()
                    .all(|dep| completed.contains(dep.as_str()))
            })
            .collect()
    }

    /// Queued active items that list `id` as a dependency.
    pub fn queued_dependants<'a>(&'a self, id: &str) -> Vec<&'a WorkItem> {
        self.active
            .iter()
            .filter(|item| item.status == ItemStatus::Queued && item.id != id)
            .filter(|item| item.dependencies.iter().any(|dep| dep == id))
            .collect()
    }

    /// Remove every copy of `id`, returning the most recently updated one.
    fn take(&mut self, id: &str) -> Option<WorkItem> {
        let mut found: Option<WorkItem> = None;
        for list in [&mut self.active, &mut self.blocked, &mut self.completed] {
            let mut idx = 0;
            while idx < list.len() {
                if list[idx].id == id {
                    let item = list.remove(idx);
                    found = match found {
                        Some(prev) if prev.updated_at > item.updated_at => Some(prev),
                        _ => Some(item),
                    };
                } else {
                    idx += 1;
                }
            }
        }
        found
    }

    fn transition<F>(&mut self, id: &str, target: Collection, now: &str, apply: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut WorkItem),
    {
        let mut item = self
            .take(id)
            .ok_or_else(|| QueueError::UnknownItem(id.to_string()))?;
        apply(&mut item);
        item.updated_at = now.to_string();
        match target {
            Collection::Active => self.active.push(item),
            Collection::Completed => self.completed.push(item),
            Collection::Blocked => self.blocked.push(item),
        }
        Ok(())
    }

    pub fn mark_assigned(&mut self, id: &str, agent_id: &str, now: &str) -> Result<(), QueueError> {
        self.transition(id, Collection::Active, now, |item| {
            item.status = ItemStatus::Assigned;
            item.assigned_agent = Some(agent_id.to_string());
        })
    }

    pub fn mark_running(&mut self, id: &str, now: &str) -> Result<(), QueueError> {
        self.transition(id, Collection::Active, now, |item| {
            item.status = ItemStatus::Running;
        })
    }

    pub fn mark_validating(&mut self, id: &str, now: &str) -> Result<(), QueueError> {
        self.transition(id, Collection::Active, now, |item| {
            item.status = ItemStatus::Validating;
        })
    }

    /// Archive `id` as completed. Any stale completed entry with the same id is replaced.
    pub fn mark_completed(
        &mut self,
        id: &str,
        summary: &str,
        commit_sha: Option<&str>,
        now: &str,
    ) -> Result<(), QueueError> {
        self.transition(id, Collection::Completed, now, |item| {
            item.status = ItemStatus::Completed;
            item.result_summary = Some(summary.to_string());
            item.commit_sha = commit_sha.map(str::to_string);
            item.blocker_reason = None;
            item.blocker_category = None;
        })
    }

    pub fn mark_blocked(
        &mut self,
        id: &str,
        reason: &str,
        category: Option<&str>,
        now: &str,
    ) -> Result<(), QueueError> {
        self.transition(id, Collection::Blocked, now, |item| {
            item.status = ItemStatus::Blocked;
            item.blocker_reason = Some(reason.to_string());
            item.blocker_category = category.map(str::to_string);
        })
    }

    /// Bump `retry_count`, requeue the item, and return the new count.
    pub fn increment_retry(&mut self, id: &str, reason: &str, now: &str) -> Result<u32, QueueError> {
        let mut count = 0;
        self.transition(id, Collection::Active, now, |item| {
            item.retry_count += 1;
            item.status = ItemStatus::Queued;
            item.assigned_agent = None;
            item.last_failure_reason = Some(reason.to_string());
            count = item.retry_count;
        })?;
        Ok(count)
    }

    /// Move a blocked item back to active. Returns false when `id` is not
    /// blocked or already lives in active/completed.
    pub fn requeue_blocked(&mut self, id: &str, reason: &str, now: &str) -> bool {
        if self.location(id) != Some(Collection::Blocked) {
            return false;
        }
        self.transition(id, Collection::Active, now, |item| {
            item.status = ItemStatus::Queued;
            item.assigned_agent = None;
            item.last_unblocked_reason = Some(reason.to_string());
            item.blocked_revisit_count += 1;
        })
        .is_ok()
    }

    /// Insert a new active item unless its id already exists anywhere.
    pub fn append_item(&mut self, item: WorkItem) -> bool {
        if self.contains(&item.id) {
            return false;
        }
        self.active.push(item);
        true
    }

    /// Drop duplicate ids across completed and blocked, keeping the entry
    /// with the latest `updated_at` (later position wins ties).
    ///
    /// Returns the ids that had copies removed, sorted.
    pub fn repair_archive_duplicates(&mut self) -> Vec<String> {
        // (collection, index) of the surviving copy per id
        let mut winners: BTreeMap<String, (Collection, usize, String)> = BTreeMap::new();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for (collection, list) in [
            (Collection::Completed, &self.completed),
            (Collection::Blocked, &self.blocked),
        ] {
            for (idx, item) in list.iter().enumerate() {
                *counts.entry(item.id.clone()).or_default() += 1;
                let replace = match winners.get(&item.id) {
                    Some((_, _, updated_at)) => item.updated_at >= *updated_at,
                    None => true,
                };
                if replace {
                    winners.insert(
                        item.id.clone(),
                        (collection, idx, item.updated_at.clone()),
                    );
                }
            }
        }

        let duplicated: Vec<String> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(id, _)| id)
            .collect();
        if duplicated.is_empty() {
            return duplicated;
        }

        let keep = |collection: Collection, idx: usize, item: &WorkItem| -> bool {
            match winners.get(&item.id) {
                Some((c, i, _)) => *c == collection && *i == idx,
                None => true,
            }
        };
        self.completed = self
            .completed
            .iter()
            .enumerate()
            .filter(|(idx, item)| keep(Collection::Completed, *idx, item))
            .map(|(_, item)| item.clone())
            .collect();
        self.blocked = self
            .blocked
            .iter()
            .enumerate()
            .filter(|(idx, item)| keep(Collection::Blocked, *idx, item))
            .map(|(_, item)| item.clone())
            .collect();
        duplicated
    }

    /// Ids present in more than one collection (partition violations).
    pub fn partition_overlaps(&self) -> Vec<String> {
        let active: HashSet<&str> = self.active.iter().map(|item| item.id.as_str()).collect();
        let completed = self.completed_ids();
        let blocked = self.blocked_ids();
        let mut overlaps: Vec<String> = active
            .intersection(&completed)
            .chain(active.intersection(&blocked))
            .chain(completed.intersection(&blocked))
            .map(|id| id.to_string())
            .collect();
        overlaps.sort();
        overlaps.dedup();
        overlaps
    }
}

/// Build the `{src.id}-ESC` follow-up for a repeatedly failing item.
pub fn create_escalation_item(src: &WorkItem, lead_agent: &str, reason: &str, now: &str) -> WorkItem {
    let mut item = WorkItem::new(
        format!("{}-ESC", src.id),
        format!("Escalation: {}", src.title),
        "lead",
        Priority::High,
        now,
    );
    item.item_type = "qa".to_string();
    item.milestone = src.milestone.clone();
    item.preferred_agent = Some(lead_agent.to_string());
    item.description = format!(
        "Work item {} ('{}') exceeded its retry budget after {} attempts. Last failure: {}. \
         Review coordination/runtime/run-history.jsonl for item {} to find the root cause, \
         then fix it or re-plan the item.",
        src.id, src.title, src.retry_count, reason, src.id
    );
    item.acceptance_criteria = vec![
        "root cause identified".to_string(),
        format!("{} unblocked, re-planned, or explicitly canceled", src.id),
    ];
    item.inputs = src.inputs.clone();
    item.escalation_target = "human".to_string();
    item.last_failure_reason = Some(reason.to_string());
    item.auto_generated = Some(auto_tag::ESCALATION.to_string());
    item
}

/// Reason recorded on an item that crossed its retry threshold.
pub const RETRY_THRESHOLD_REASON: &str = "retry threshold exceeded; escalated";

/// Category paired with [`RETRY_THRESHOLD_REASON`].
pub const RETRY_THRESHOLD_CATEGORY: &str = blocker_category::RETRY_THRESHOLD;
