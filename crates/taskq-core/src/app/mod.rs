//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **TaskQueueBuilder**: キューの構築とワイヤリング
//! - **TaskQueue**: 公開 API（enqueue / tasks / restart / cancel / run）
//! - **QueueEngine**: mutex グループと strategy を考慮した 1 件の選択
//! - **TaskRunner**: handler 実行と結果の反映（retry / fail / unblock）
//! - **WorkerLoop / WorkerGroup**: select → execute のループ

pub mod builder;
pub mod engine;
pub mod runner;
pub mod runtime;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, TaskQueueBuilder};
pub use self::engine::{QueueEngine, Selection, SiblingAction, SiblingOutcome};
pub use self::runner::TaskRunner;
pub use self::runtime::{EnqueueOptions, TaskQueue};
pub use self::status::StatusCounts;
pub use self::worker_loop::{WorkerGroup, WorkerLoop};
