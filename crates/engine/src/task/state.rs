//! Persistent state of one task, owned exclusively by the task engine.

use serde::{Deserialize, Serialize};

use crate::ids::{TaskId, TaskName, WorkflowId};
use crate::messages::{JobStatus, RetryPolicy};

/// Lifecycle of a task.
///
/// `Completed` and `Canceled` are terminal and the record is deleted in the
/// same transition; `Failed` (retry budget exhausted) is kept for operator
/// visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ongoing,
    FailedAwaitingRetry,
    Failed,
    Completed,
    Canceled,
}

impl TaskStatus {
    /// Monitoring bucket this status reports into.
    pub fn job_status(&self) -> JobStatus {
        match self {
            TaskStatus::Ongoing => JobStatus::RunningOk,
            TaskStatus::FailedAwaitingRetry => JobStatus::RunningWarning,
            TaskStatus::Failed => JobStatus::RunningError,
            TaskStatus::Completed => JobStatus::TerminatedCompleted,
            TaskStatus::Canceled => JobStatus::TerminatedCanceled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: TaskId,
    pub task_name: TaskName,
    /// Owning workflow, when the task was dispatched by a decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<WorkflowId>,
    pub status: TaskStatus,
    /// Counts fresh attempts (bumped by an operator retry of a failed task).
    pub attempt_index: u32,
    /// Counts automatic retries within the current attempt.
    pub attempt_retry: u32,
    pub input: Vec<serde_json::Value>,
    pub retry: RetryPolicy,
    pub attempt_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Canceled)
    }

    /// Whether an attempt notification refers to the live attempt.
    pub fn matches_attempt(&self, attempt_index: u32, attempt_retry: u32) -> bool {
        self.attempt_index == attempt_index && self.attempt_retry == attempt_retry
    }
}
