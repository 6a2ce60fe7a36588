//! Errors - エラー型と分類
//!
//! - `HandlerError`: ハンドラが返す失敗。Task Runner が Run に変換し、外には伝播しない
//! - `StoreError`: ストア（PG / InMemory）の失敗。回復せずに Worker Loop まで伝播する
//! - `TaskqError`: 公開 API のエラー

use thiserror::Error;

use super::ids::TaskId;
use super::task::HandlerKey;

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Failure of the relational store or of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Connection loss, query failure, pool exhaustion.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A write violated a store invariant (duplicate entry, missing row).
    #[error("store conflict: {0}")]
    Conflict(String),

    /// A persisted row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum TaskqError {
    #[error("no handler registered for {0}")]
    UnregisteredTask(HandlerKey),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payload codec: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T, E = TaskqError> = std::result::Result<T, E>;
