//! Queue entry: the schedulable record of a pending or in-flight task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::ids::{EntryId, TaskId};

/// Queue entry as persisted in the `queue` table.
///
/// Design:
/// - At most one entry per task.
/// - Entries that share `mutex` are resolved together at selection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub task_id: TaskId,
    /// Higher is more urgent.
    pub priority: i32,
    pub mutex: String,
    /// How many times the task was put back after a failed run.
    pub retries: u32,
    pub created: DateTime<Utc>,
    /// Not eligible before this instant (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }

    /// Selection order: priority desc, then creation asc (FIFO within a priority).
    pub fn selection_order(a: &QueueEntry, b: &QueueEntry) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created.cmp(&b.created))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Values the caller supplies; the store assigns `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub task_id: TaskId,
    pub priority: i32,
    pub mutex: String,
    pub created: DateTime<Utc>,
}

impl NewEntry {
    pub fn into_entry(self, id: EntryId) -> QueueEntry {
        QueueEntry {
            id,
            task_id: self.task_id,
            priority: self.priority,
            mutex: self.mutex,
            retries: 0,
            created: self.created,
            not_before: None,
        }
    }
}
