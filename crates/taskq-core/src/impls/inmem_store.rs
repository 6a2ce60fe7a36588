//! InMemoryTaskStore - 開発・テスト用の正本
//!
//! # 実装詳細
//! - ストア全体を 1 つの `tokio::sync::Mutex` で守る
//! - `begin()` で `OwnedMutexGuard` を取り、状態のコピー（working set）を作る
//! - `commit()` で working set を書き戻す。commit せずに drop すればロールバック
//!
//! トランザクションは完全に直列化されるので、PostgreSQL 版の
//! `SKIP LOCKED` / advisory lock が必要になる競合はそもそも起きません。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{
    EntryId, NewEntry, QueueEntry, Run, StoreError, Task, TaskId, TaskStatus,
};
use crate::ports::{Candidate, StoreTx, TaskStore};

#[derive(Debug, Clone, Default)]
struct MemState {
    /// Tasks in insertion order; tasks are never deleted.
    tasks: Vec<Task>,
    task_index: HashMap<TaskId, usize>,

    entries: BTreeMap<EntryId, QueueEntry>,
    entry_by_task: HashMap<TaskId, EntryId>,

    runs: Vec<Run>,

    next_entry_id: i64,
}

impl MemState {
    fn task(&self, id: TaskId) -> Option<&Task> {
        self.task_index.get(&id).map(|&i| &self.tasks[i])
    }

    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.task_index.get(&id).map(|&i| &mut self.tasks[i])
    }

    fn eligible_entries(&self, now: DateTime<Utc>) -> impl Iterator<Item = &QueueEntry> {
        self.entries.values().filter(move |entry| {
            entry.is_due(now)
                && self
                    .task(entry.task_id)
                    .is_some_and(|task| task.status.is_eligible())
        })
    }
}

/// In-memory implementation of [`TaskStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<MemState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTx { guard, working }))
    }
}

struct InMemoryTx {
    guard: OwnedMutexGuard<MemState>,
    working: MemState,
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn insert_task(&mut self, task: &Task) -> Result<(), StoreError> {
        let state = &mut self.working;
        if state.task_index.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("duplicate task {}", task.id)));
        }
        state.task_index.insert(task.id, state.tasks.len());
        state.tasks.push(task.clone());
        Ok(())
    }

    async fn insert_entry(&mut self, entry: NewEntry) -> Result<QueueEntry, StoreError> {
        let state = &mut self.working;
        if state.task(entry.task_id).is_none() {
            return Err(StoreError::Conflict(format!(
                "entry for unknown task {}",
                entry.task_id
            )));
        }
        if state.entry_by_task.contains_key(&entry.task_id) {
            return Err(StoreError::Conflict(format!(
                "task {} already has a queue entry",
                entry.task_id
            )));
        }
        state.next_entry_id += 1;
        let entry = entry.into_entry(EntryId::new(state.next_entry_id));
        state.entry_by_task.insert(entry.task_id, entry.id);
        state.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_task(&mut self, id: TaskId, _for_update: bool) -> Result<Option<Task>, StoreError> {
        // The store-wide lock already makes every read exclusive.
        Ok(self.working.task(id).cloned())
    }

    async fn list_tasks(&mut self, include_completed: bool) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .working
            .tasks
            .iter()
            .filter(|task| include_completed || task.status != TaskStatus::Completed)
            .cloned()
            .collect())
    }

    async fn entry_for_task(&mut self, task_id: TaskId) -> Result<Option<QueueEntry>, StoreError> {
        let state = &self.working;
        Ok(state
            .entry_by_task
            .get(&task_id)
            .and_then(|id| state.entries.get(id))
            .cloned())
    }

    async fn next_mutex(
        &mut self,
        now: DateTime<Utc>,
        skip: &[String],
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .working
            .eligible_entries(now)
            .filter(|entry| !skip.contains(&entry.mutex))
            .min_by(|a, b| QueueEntry::selection_order(a, b))
            .map(|entry| entry.mutex.clone()))
    }

    async fn try_lock_mutex(&mut self, _mutex: &str) -> Result<bool, StoreError> {
        Ok(true)
    }

    // the store-wide guard already serializes transactions
    async fn lock_mutex(&mut self, _mutex: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn lock_group(
        &mut self,
        mutex: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let state = &self.working;
        let mut entries: Vec<&QueueEntry> = state
            .eligible_entries(now)
            .filter(|entry| entry.mutex == mutex)
            .collect();
        entries.sort_by(|a, b| QueueEntry::selection_order(a, b));

        entries
            .into_iter()
            .map(|entry| {
                let task = state.task(entry.task_id).cloned().ok_or_else(|| {
                    StoreError::Corrupt(format!("{} points at a missing task", entry.id))
                })?;
                Ok(Candidate {
                    entry: entry.clone(),
                    task,
                })
            })
            .collect()
    }

    async fn has_in_flight(&mut self, mutex: &str) -> Result<bool, StoreError> {
        let state = &self.working;
        Ok(state.entries.values().any(|entry| {
            entry.mutex == mutex
                && state
                    .task(entry.task_id)
                    .is_some_and(|task| task.status == TaskStatus::Progress)
        }))
    }

    async fn set_status(
        &mut self,
        ids: &[TaskId],
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for &id in ids {
            let task = self
                .working
                .task_mut(id)
                .ok_or_else(|| StoreError::Conflict(format!("unknown task {id}")))?;
            task.status = status;
            task.updated = now;
        }
        Ok(())
    }

    async fn delete_entries(&mut self, ids: &[EntryId]) -> Result<(), StoreError> {
        let state = &mut self.working;
        for id in ids {
            if let Some(entry) = state.entries.remove(id) {
                state.entry_by_task.remove(&entry.task_id);
            }
        }
        Ok(())
    }

    async fn requeue_entry(
        &mut self,
        id: EntryId,
        retries: u32,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let entry = self
            .working
            .entries
            .get_mut(&id)
            .ok_or_else(|| StoreError::Conflict(format!("unknown {id}")))?;
        entry.retries = retries;
        entry.not_before = not_before;
        Ok(())
    }

    async fn unblock_mutex(
        &mut self,
        mutex: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let state = &mut self.working;
        let blocked: Vec<TaskId> = state
            .entries
            .values()
            .filter(|entry| entry.mutex == mutex)
            .map(|entry| entry.task_id)
            .filter(|&id| state.task(id).is_some_and(|t| t.status == TaskStatus::Blocked))
            .collect();
        for &id in &blocked {
            if let Some(task) = state.task_mut(id) {
                task.status = TaskStatus::New;
                task.updated = now;
            }
        }
        Ok(blocked)
    }

    async fn insert_run(&mut self, run: &Run) -> Result<(), StoreError> {
        if self.working.task(run.task_id).is_none() {
            return Err(StoreError::Conflict(format!(
                "run for unknown task {}",
                run.task_id
            )));
        }
        self.working.runs.push(run.clone());
        Ok(())
    }

    async fn list_runs(&mut self, task_id: TaskId) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .working
            .runs
            .iter()
            .filter(|run| run.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn delete_runs(&mut self, task_id: TaskId) -> Result<u64, StoreError> {
        let before = self.working.runs.len();
        self.working.runs.retain(|run| run.task_id != task_id);
        Ok((before - self.working.runs.len()) as u64)
    }

    async fn count_by_status(&mut self) -> Result<Vec<(TaskStatus, u64)>, StoreError> {
        let mut counts: HashMap<TaskStatus, u64> = HashMap::new();
        for task in &self.working.tasks {
            *counts.entry(task.status).or_default() += 1;
        }
        Ok(TaskStatus::ALL
            .into_iter()
            .filter_map(|status| counts.get(&status).map(|&n| (status, n)))
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
