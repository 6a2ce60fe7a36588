//! taskq-core
//!
//! Core building blocks of a relational-store-backed task queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, entry, run, state, strategy, retry, errors）
//! - **ports**: 抽象化レイヤー（TaskStore / StoreTx, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（engine, runner, worker_loop, runtime, builder）
//! - **typed**: 型付き Task API と handler レジストリ
//! - **impls**: 実装（InMemoryTaskStore）
//! - **config**: 設定の読み込み

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{BuildError, EnqueueOptions, StatusCounts, TaskQueue, TaskQueueBuilder, WorkerGroup};
pub use config::{ConfigError, TaskqConfig};
pub use domain::{
    ConcurrencyStrategy, HandlerError, HandlerKey, Payload, QueueEntry, RetryBudget, RetryPolicy,
    Run, Task, TaskId, TaskStatus, TaskqError,
};
pub use typed::{Handler, Registry, TaskArgs, TaskOptions};
