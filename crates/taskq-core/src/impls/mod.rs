//! Impls - 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: テスト・単一プロセス用の正本
//!
//! # 本番用実装
//! 本番用の実装は別クレートに配置します：
//! - `taskq-pg`: PgTaskStore

pub mod inmem_store;

pub use self::inmem_store::InMemoryTaskStore;
