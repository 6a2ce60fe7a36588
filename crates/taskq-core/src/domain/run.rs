//! Run: the immutable record of one execution attempt.
//!
//! Run は「なぜ失敗したか」を後から説明するための履歴です。
//! 成功・失敗にかかわらず 1 回の実行につき 1 件作られ、更新されません。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{RunId, TaskId};

/// Classification of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// The handler returned an error.
    Handler,
    /// The handler panicked.
    Panic,
    /// The handler exceeded the configured execution timeout.
    Timeout,
    /// No handler is registered under the task's key.
    Unregistered,
    /// The payload could not be decoded into the handler's argument type.
    Decode,
}

/// Serialized failure detail stored in `Run::error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Run record as persisted in the `task_runs` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub task_id: TaskId,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created: DateTime<Utc>,
}

impl Run {
    pub fn success(
        id: RunId,
        task_id: TaskId,
        output: serde_json::Value,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            output: Some(output),
            error: None,
            created,
        }
    }

    pub fn failure(id: RunId, task_id: TaskId, error: &RunError, created: DateTime<Utc>) -> Self {
        Self {
            id,
            task_id,
            output: None,
            error: Some(serde_json::json!({
                "kind": error.kind,
                "message": error.message,
            })),
            created,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Decodes the stored failure detail, if this run failed.
    pub fn run_error(&self) -> Option<RunError> {
        self.error
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}
