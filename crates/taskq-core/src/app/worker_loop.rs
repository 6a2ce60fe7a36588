//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. QueueEngine::select_next() で 1 件選ぶ（なければ poll_interval だけ待つ）
//! 2. TaskRunner::execute() で実行し、結果を反映
//! 3. 繰り返す
//!
//! ワーカー間の協調はすべてストアのトランザクションで行うので、
//! 同じプロセス内でも別プロセスでも同じように並べて動かせます。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::engine::QueueEngine;
use super::runner::TaskRunner;
use crate::domain::{Result, Run};

/// WorkerLoop は select → execute を繰り返す
pub struct WorkerLoop {
    engine: QueueEngine,
    runner: TaskRunner,
    poll_interval: Duration,
}

impl WorkerLoop {
    pub fn new(engine: QueueEngine, runner: TaskRunner, poll_interval: Duration) -> Self {
        Self {
            engine,
            runner,
            poll_interval,
        }
    }

    pub fn engine(&self) -> &QueueEngine {
        &self.engine
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// One iteration: select and execute a single task.
    /// `Ok(None)` means nothing was eligible.
    pub async fn run_once(&self) -> Result<Option<Run>> {
        let Some(selection) = self.engine.select_next().await? else {
            return Ok(None);
        };
        let run = self.runner.execute(selection).await?;
        Ok(Some(run))
    }

    /// Loops until `shutdown_rx` turns `true` or its sender is dropped.
    ///
    /// Store errors are logged and retried on the next poll. An in-flight
    /// handler is always allowed to finish.
    pub async fn run(&self, worker_id: usize, mut shutdown_rx: watch::Receiver<bool>) {
        info!(worker_id, "worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    error!(worker_id, error = %err, "worker iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {
                        debug!(worker_id, "polling");
                    }
                }
            }
        }
        info!(worker_id, "worker stopped");
    }
}

/// Worker group handle.
/// - `shutdown_tx` を drop するとワーカー全体が止まる
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` loops sharing one worker.
    pub fn spawn(n: usize, worker: Arc<WorkerLoop>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let worker = Arc::clone(&worker);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker.run(worker_id, rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Request shutdown for all workers. Running handlers are not
    /// interrupted; workers stop before selecting the next task.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::TaskQueueBuilder;
    use crate::config::TaskqConfig;
    use crate::domain::{
        ConcurrencyStrategy, HandlerError, HandlerKey, NewEntry, Payload, Task, TaskId,
        TaskStatus,
    };
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{Clock, SystemClock, TaskStore, UlidGenerator};
    use crate::typed::handler::testing::EchoHandler;
    use crate::typed::{FnHandler, Registry, TaskOptions};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker(store: Arc<InMemoryTaskStore>) -> WorkerLoop {
        let mut registry = Registry::new();
        registry.register("echo", EchoHandler, TaskOptions::new());
        let registry = Arc::new(registry);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        WorkerLoop::new(
            QueueEngine::new(store.clone(), registry.clone(), clock.clone()),
            TaskRunner::new(
                store,
                registry,
                Arc::new(UlidGenerator::new(clock.clone())),
                clock,
            ),
            Duration::from_millis(5),
        )
    }

    async fn enqueue(store: &InMemoryTaskStore, n: usize) -> Vec<TaskId> {
        let mut ids = Vec::new();
        let mut tx = store.begin().await.unwrap();
        for i in 0..n {
            let task = Task::new(
                TaskId::from_ulid(ulid::Ulid::new()),
                "echo",
                HandlerKey::new("echo"),
                Payload::new().arg(i),
                Utc::now(),
            );
            tx.insert_task(&task).await.unwrap();
            tx.insert_entry(NewEntry {
                task_id: task.id,
                priority: 0,
                mutex: task.id.to_string(),
                created: task.created,
            })
            .await
            .unwrap();
            ids.push(task.id);
        }
        tx.commit().await.unwrap();
        ids
    }

    #[tokio::test]
    async fn run_once_reports_idle() {
        let store = Arc::new(InMemoryTaskStore::new());
        let worker = worker(store);
        assert!(worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn group_drains_the_queue_and_shuts_down() {
        let store = Arc::new(InMemoryTaskStore::new());
        let ids = enqueue(&store, 10).await;
        let group = WorkerGroup::spawn(3, Arc::new(worker(store.clone())));
        assert_eq!(group.len(), 3);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let mut tx = store.begin().await.unwrap();
            let open = tx.list_tasks(false).await.unwrap();
            drop(tx);
            if open.is_empty() || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        group.shutdown_and_join().await;

        let mut tx = store.begin().await.unwrap();
        for id in ids {
            let task = tx.get_task(id, false).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn unique_key_never_runs_twice_at_once() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handler = {
            let (active, peak) = (active.clone(), peak.clone());
            FnHandler::new(move |payload: Payload| {
                let (active, peak) = (active.clone(), peak.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(payload.to_json())
                }
            })
        };

        let mut config = TaskqConfig::default();
        config.worker.concurrency = 4;
        config.worker.poll_interval = Duration::from_millis(5);
        let q = TaskQueueBuilder::new()
            .config(config)
            .register(
                "serial",
                handler,
                TaskOptions::new().strategy(ConcurrencyStrategy::Unique),
            )
            .build()
            .unwrap();

        let mut ids = Vec::new();
        for i in 0..8 {
            let entry = q.enqueue("serial", Payload::new().arg(i)).await.unwrap();
            assert_eq!(entry.mutex, "serial");
            ids.push(entry.task_id);
        }

        let group = q.spawn_workers();
        assert_eq!(group.len(), 4);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while q.counts().await.unwrap().pending() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        group.shutdown_and_join().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        for id in ids {
            let task = q.get_task(id, false).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
        }
    }
}
