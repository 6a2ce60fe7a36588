//! TaskQueueBuilder - キューの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use super::engine::QueueEngine;
use super::runner::TaskRunner;
use super::runtime::TaskQueue;
use super::worker_loop::WorkerLoop;
use crate::config::TaskqConfig;
use crate::domain::HandlerKey;
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::typed::{DynHandler, Handler, Registry, TaskArgs, TaskOptions};

/// TaskQueueBuilder はキューを構築
///
/// # 使用例
/// ```ignore
/// let queue = TaskQueueBuilder::new()
///     .store(Arc::new(pg_store))
///     .config(TaskqConfig::load()?)
///     .register_task::<SendMailArgs, _>(SendMail, TaskOptions::new().retries(3))
///     .expect_handlers(&["mail.send"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_handlers() で期待される handler key を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct TaskQueueBuilder {
    registry: Registry,
    expected_handlers: Option<Vec<String>>,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    config: TaskqConfig,
}

/// BuildError はキュー構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing handlers: {0:?}. These handlers were expected but not registered.")]
    MissingHandlers(Vec<String>),
}

impl TaskQueueBuilder {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            expected_handlers: None,
            store: None,
            clock: None,
            ids: None,
            config: TaskqConfig::default(),
        }
    }

    pub fn register<H: DynHandler + 'static>(
        mut self,
        key: impl Into<HandlerKey>,
        handler: H,
        options: TaskOptions,
    ) -> Self {
        self.registry.register(key, handler, options);
        self
    }

    pub fn register_task<T: TaskArgs, H: Handler<T> + 'static>(
        mut self,
        handler: H,
        options: TaskOptions,
    ) -> Self {
        self.registry.register_task::<T, H>(handler, options);
        self
    }

    /// Replaces the whole registry, e.g. one assembled elsewhere.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// 期待される handler key のリストを設定
    pub fn expect_handlers(mut self, keys: &[&str]) -> Self {
        self.expected_handlers = Some(keys.iter().map(|k| k.to_string()).collect());
        self
    }

    /// Defaults to a fresh `InMemoryTaskStore`.
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Worker and retry settings; the database and log sections are read by
    /// the host when it creates the store and the subscriber.
    pub fn config(mut self, config: TaskqConfig) -> Self {
        self.config = config;
        self
    }

    /// # 検証
    /// - expect_handlers() で設定された key が全て登録されているかチェック
    /// - 不足があれば BuildError::MissingHandlers を返す
    pub fn build(self) -> Result<TaskQueue, BuildError> {
        if let Some(expected) = &self.expected_handlers {
            let missing: Vec<String> = expected
                .iter()
                .filter(|key| !self.registry.contains(key))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let registry = Arc::new(self.registry);
        let TaskqConfig { worker, retry, .. } = self.config;

        let engine = QueueEngine::new(store.clone(), registry.clone(), clock.clone());
        let runner = TaskRunner::new(store.clone(), registry.clone(), ids.clone(), clock.clone())
            .with_retry_policy(retry)
            .with_timeout(worker.handler_timeout);
        let worker_loop = WorkerLoop::new(engine, runner, worker.poll_interval);

        tracing::debug!(
            handlers = ?registry.registered_keys(),
            concurrency = worker.concurrency,
            "task queue built"
        );
        Ok(TaskQueue::new(
            store,
            registry,
            ids,
            clock,
            worker_loop,
            worker.concurrency,
        ))
    }
}

impl Default for TaskQueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}
