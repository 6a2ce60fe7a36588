//! TaskQueue - ホストアプリケーションから見た公開 API
//!
//! enqueue / get_task / tasks / restart / cancel / run をまとめた facade です。
//! 状態を変える操作はそれぞれ 1 トランザクションで完結します。

use std::sync::Arc;

use tracing::{debug, info};

use super::status::StatusCounts;
use super::worker_loop::{WorkerGroup, WorkerLoop};
use crate::domain::{
    NewEntry, Payload, QueueEntry, Result, Run, Task, TaskId, TaskStatus, TaskqError,
};
use crate::ports::{Clock, IdGenerator, TaskStore};
use crate::typed::{HandlerRef, Registry, TaskArgs, TaskProxy};

/// Per-call overrides of the registered proxy's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub mutex: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn mutex(mut self, mutex: impl Into<String>) -> Self {
        self.mutex = Some(mutex.into());
        self
    }
}

/// TaskQueue はキューの公開 API
///
/// `TaskQueueBuilder` で組み立てます。
///
/// # 使用例
/// ```ignore
/// let queue = TaskQueueBuilder::new()
///     .register_task::<SendMailArgs, _>(SendMail, TaskOptions::new().retries(3))
///     .build()?;
///
/// let entry = queue.enqueue_task(&SendMailArgs { to: "a@example.com".into() }).await?;
/// queue.run().await?;
/// ```
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    registry: Arc<Registry>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    worker: Arc<WorkerLoop>,
    concurrency: usize,
}

impl TaskQueue {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<Registry>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        worker: WorkerLoop,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            registry,
            ids,
            clock,
            worker: Arc::new(worker),
            concurrency,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn enqueue<'a>(
        &self,
        handler: impl Into<HandlerRef<'a>>,
        payload: Payload,
    ) -> Result<QueueEntry> {
        self.enqueue_with(handler, payload, EnqueueOptions::default())
            .await
    }

    /// Creates a task and its queue entry in one transaction.
    pub async fn enqueue_with<'a>(
        &self,
        handler: impl Into<HandlerRef<'a>>,
        payload: Payload,
        options: EnqueueOptions,
    ) -> Result<QueueEntry> {
        let proxy = self.registry.resolve(handler)?;
        let now = self.clock.now();
        let id = self.ids.generate_task_id();

        let task = Task::new(
            id,
            options.name.unwrap_or_else(|| proxy.name().to_string()),
            proxy.key().clone(),
            payload,
            now,
        );
        let new_entry = NewEntry {
            task_id: id,
            priority: options.priority.unwrap_or(proxy.priority()),
            mutex: options.mutex.unwrap_or_else(|| proxy.default_mutex(id)),
            created: now,
        };

        let mut tx = self.store.begin().await?;
        tx.insert_task(&task).await?;
        let entry = tx.insert_entry(new_entry).await?;
        tx.commit().await?;

        info!(
            task_id = %id,
            handler = %task.handler,
            mutex = %entry.mutex,
            priority = entry.priority,
            "task enqueued"
        );
        Ok(entry)
    }

    pub async fn enqueue_task<T: TaskArgs>(&self, args: &T) -> Result<QueueEntry> {
        let payload = args.to_payload()?;
        self.enqueue(T::KEY, payload).await
    }

    /// Loads a task. With `for_update` the row is read under a write lock,
    /// which is released when this call returns.
    pub async fn get_task(&self, id: TaskId, for_update: bool) -> Result<Option<Task>> {
        let mut tx = self.store.begin().await?;
        let task = tx.get_task(id, for_update).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Tasks ordered by creation. COMPLETED tasks are left out unless
    /// `include_completed` is set.
    pub async fn tasks(&self, include_completed: bool) -> Result<Vec<Task>> {
        let mut tx = self.store.begin().await?;
        let tasks = tx.list_tasks(include_completed).await?;
        tx.commit().await?;
        Ok(tasks)
    }

    /// Enqueues a fresh copy of `id` (same name, handler and payload).
    /// The original task and its runs are left untouched.
    pub async fn restart(&self, id: TaskId) -> Result<Task> {
        let mut tx = self.store.begin().await?;
        let original = tx
            .get_task(id, false)
            .await?
            .ok_or(TaskqError::TaskNotFound(id))?;
        let proxy: TaskProxy = self.registry.resolve(&original.handler)?;

        let now = self.clock.now();
        let task = original.restarted(self.ids.generate_task_id(), now);
        tx.insert_task(&task).await?;
        tx.insert_entry(NewEntry {
            task_id: task.id,
            priority: proxy.priority(),
            mutex: proxy.default_mutex(task.id),
            created: now,
        })
        .await?;
        tx.commit().await?;

        info!(task_id = %task.id, restarted_from = %id, "task restarted");
        Ok(task)
    }

    /// Cancels a task that has not been picked up yet (NEW or RETRY).
    /// Deletes its runs and queue entry. Returns `false` and changes nothing
    /// for any other status.
    pub async fn cancel(&self, id: TaskId) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let task = tx
            .get_task(id, true)
            .await?
            .ok_or(TaskqError::TaskNotFound(id))?;

        if !task.status.is_cancellable() {
            tx.rollback().await?;
            debug!(task_id = %id, status = %task.status, "cancel ignored");
            return Ok(false);
        }

        let now = self.clock.now();
        let purged = tx.delete_runs(id).await?;
        if let Some(entry) = tx.entry_for_task(id).await? {
            tx.delete_entries(&[entry.id]).await?;
        }
        tx.set_status(&[id], TaskStatus::Cancelled, now).await?;
        tx.commit().await?;

        info!(task_id = %id, purged_runs = purged, "task cancelled");
        Ok(true)
    }

    /// Runs of a task, oldest first.
    pub async fn runs(&self, id: TaskId) -> Result<Vec<Run>> {
        let mut tx = self.store.begin().await?;
        let runs = tx.list_runs(id).await?;
        tx.commit().await?;
        Ok(runs)
    }

    pub async fn entry(&self, id: TaskId) -> Result<Option<QueueEntry>> {
        let mut tx = self.store.begin().await?;
        let entry = tx.entry_for_task(id).await?;
        tx.commit().await?;
        Ok(entry)
    }

    pub async fn counts(&self) -> Result<StatusCounts> {
        let mut tx = self.store.begin().await?;
        let rows = tx.count_by_status().await?;
        tx.commit().await?;
        Ok(rows.into_iter().collect())
    }

    /// One worker iteration. `Ok(None)` when nothing was eligible.
    pub async fn run(&self) -> Result<Option<Run>> {
        self.worker.run_once().await
    }

    pub fn worker(&self) -> Arc<WorkerLoop> {
        Arc::clone(&self.worker)
    }

    /// Spawns the configured number of worker loops.
    pub fn spawn_workers(&self) -> WorkerGroup {
        WorkerGroup::spawn(self.concurrency, self.worker())
    }
}
