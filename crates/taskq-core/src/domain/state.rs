//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// TaskStatus はタスクの状態を表現
///
/// # 状態遷移
/// - NEW -> PROGRESS -> COMPLETED | RETRY | FAILED
/// - RETRY -> PROGRESS（後で再選択）
/// - NEW -> BLOCKED（UNIQUE で保留）-> NEW（解放）
/// - NEW | RETRY -> CANCELLED（FIRST/LAST で置き換え、または明示的な cancel）
///
/// COMPLETED / FAILED / CANCELLED は終端状態で、Queue Entry を持ちません。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Progress,
    Retry,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::New,
        TaskStatus::Progress,
        TaskStatus::Retry,
        TaskStatus::Blocked,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Terminal states never own a queue entry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Eligible for selection by the queue engine.
    pub fn is_eligible(self) -> bool {
        matches!(self, TaskStatus::New | TaskStatus::Retry)
    }

    /// Explicit cancellation is only allowed before a worker picks the task up.
    pub fn is_cancellable(self) -> bool {
        self.is_eligible()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::New => "NEW",
            TaskStatus::Progress => "PROGRESS",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}
