//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! リレーショナルストアと時刻・ID 生成をここで抽象化し、
//! Queue Engine / Task Runner は trait だけに依存します。
//!
//! # 設計原則
//! - リレーショナルストアが source of truth（正本）
//! - ワーカー間の協調はすべてストアのトランザクションと行ロックで行う

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{Candidate, StoreTx, TaskStore};
