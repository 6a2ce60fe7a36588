//! Status - タスク数の集計ビュー

use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;

/// Number of tasks per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub new: u64,
    pub progress: u64,
    pub retry: u64,
    pub blocked: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::New => self.new,
            TaskStatus::Progress => self.progress,
            TaskStatus::Retry => self.retry,
            TaskStatus::Blocked => self.blocked,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    fn slot(&mut self, status: TaskStatus) -> &mut u64 {
        match status {
            TaskStatus::New => &mut self.new,
            TaskStatus::Progress => &mut self.progress,
            TaskStatus::Retry => &mut self.retry,
            TaskStatus::Blocked => &mut self.blocked,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Cancelled => &mut self.cancelled,
        }
    }

    /// Tasks that still hold a queue entry.
    pub fn pending(&self) -> u64 {
        self.new + self.progress + self.retry + self.blocked
    }

    pub fn total(&self) -> u64 {
        TaskStatus::ALL.iter().map(|&s| self.get(s)).sum()
    }
}

impl FromIterator<(TaskStatus, u64)> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = (TaskStatus, u64)>>(iter: I) -> Self {
        let mut counts = Self::default();
        for (status, n) in iter {
            *counts.slot(status) += n;
        }
        counts
    }
}
