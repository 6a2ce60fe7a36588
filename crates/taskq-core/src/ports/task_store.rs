//! TaskStore port - リレーショナルストアが実装する正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - tasks: 状態と payload
//! - task_runs: 実行履歴
//! - queue: 実行待ち / 実行中のエントリ
//!
//! # 実装
//! - `impls::inmem_store::InMemoryTaskStore`（開発・テスト用）
//! - `taskq-pg` クレートの `PgTaskStore`（本番用）

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    EntryId, NewEntry, QueueEntry, Run, StoreError, Task, TaskId, TaskStatus,
};

/// An eligible queue entry loaded together with its task.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub entry: QueueEntry,
    pub task: Task,
}

/// TaskStore は unit of work（`StoreTx`）を開始する
///
/// # 設計原則
/// - 状態遷移（select / complete / retry / cancel / unblock）はすべて 1 トランザクション
/// - commit されるまで他のワーカーからは見えない
/// - `StoreTx` を commit せずに drop するとロールバック
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// One open transaction against the store.
///
/// Queries that look at the queue return rows in selection order
/// (priority desc, created asc, entry id asc).
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_task(&mut self, task: &Task) -> Result<(), StoreError>;

    async fn insert_entry(&mut self, entry: NewEntry) -> Result<QueueEntry, StoreError>;

    /// `for_update` takes a row lock that is held until commit/rollback.
    async fn get_task(&mut self, id: TaskId, for_update: bool) -> Result<Option<Task>, StoreError>;

    /// Tasks ordered by creation. COMPLETED tasks are omitted unless asked for.
    async fn list_tasks(&mut self, include_completed: bool) -> Result<Vec<Task>, StoreError>;

    async fn entry_for_task(&mut self, task_id: TaskId) -> Result<Option<QueueEntry>, StoreError>;

    /// The mutex key holding the most urgent eligible entry (highest priority,
    /// then earliest creation), ignoring keys in `skip`.
    async fn next_mutex(
        &mut self,
        now: DateTime<Utc>,
        skip: &[String],
    ) -> Result<Option<String>, StoreError>;

    /// Non-blocking, transaction-scoped claim on a mutex key. Returns `false`
    /// when another transaction already holds it.
    async fn try_lock_mutex(&mut self, mutex: &str) -> Result<bool, StoreError>;

    /// Blocking form of `try_lock_mutex`: waits for any selection that
    /// currently holds the key. Finishing a task takes it before touching
    /// the key's BLOCKED rows.
    async fn lock_mutex(&mut self, mutex: &str) -> Result<(), StoreError>;

    /// Eligible (NEW/RETRY, due) entries of `mutex`, locked for update.
    /// Rows locked by other transactions are skipped, never waited for.
    async fn lock_group(
        &mut self,
        mutex: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, StoreError>;

    /// Whether a task of this mutex key is currently PROGRESS.
    async fn has_in_flight(&mut self, mutex: &str) -> Result<bool, StoreError>;

    async fn set_status(
        &mut self,
        ids: &[TaskId],
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn delete_entries(&mut self, ids: &[EntryId]) -> Result<(), StoreError>;

    /// Keeps the entry on the queue with a new retry counter and backoff.
    async fn requeue_entry(
        &mut self,
        id: EntryId,
        retries: u32,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Moves every BLOCKED task of `mutex` back to NEW and returns their ids.
    async fn unblock_mutex(
        &mut self,
        mutex: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError>;

    async fn insert_run(&mut self, run: &Run) -> Result<(), StoreError>;

    /// Runs of a task, oldest first.
    async fn list_runs(&mut self, task_id: TaskId) -> Result<Vec<Run>, StoreError>;

    async fn delete_runs(&mut self, task_id: TaskId) -> Result<u64, StoreError>;

    async fn count_by_status(&mut self) -> Result<Vec<(TaskStatus, u64)>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
