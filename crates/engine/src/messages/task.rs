//! Messages addressed to the task engine, and the executor request payload.

use serde::{Deserialize, Serialize};

use crate::ids::{TaskId, TaskName, WorkflowId};

/// Retry policy carried with a task dispatch.
///
/// The delay grows geometrically with the retry count; delivery uses the
/// transport's delayed-delivery capability, never in-process timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_secs: u64,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt_retry` (zero-based).
    pub fn delay_for(&self, attempt_retry: u32) -> std::time::Duration {
        let secs = self.initial_delay_secs as f64 * self.backoff_factor.powi(attempt_retry as i32);
        std::time::Duration::from_secs(secs.round() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_secs: 5,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEngineMessage {
    /// Create and run a new task. The only kind valid without state.
    DispatchTask {
        task_id: TaskId,
        task_name: TaskName,
        input: Vec<serde_json::Value>,
        /// Owning workflow, when the task was dispatched by a decision.
        #[serde(skip_serializing_if = "Option::is_none")]
        workflow_id: Option<WorkflowId>,
        retry: RetryPolicy,
        /// Per-attempt timeout; a timeout check message is scheduled at
        /// dispatch time with this delay.
        attempt_timeout_secs: u64,
    },
    /// Delayed self-message scheduled by a failed attempt.
    RetryTaskAttempt {
        task_id: TaskId,
    },
    TaskAttemptStarted {
        task_id: TaskId,
        attempt_index: u32,
        attempt_retry: u32,
    },
    TaskAttemptCompleted {
        task_id: TaskId,
        attempt_index: u32,
        attempt_retry: u32,
        output: serde_json::Value,
    },
    TaskAttemptFailed {
        task_id: TaskId,
        attempt_index: u32,
        attempt_retry: u32,
        error: String,
    },
    /// Delayed self-message scheduled at attempt dispatch; only acted on if
    /// it still matches the live attempt.
    TaskAttemptTimeoutCheck {
        task_id: TaskId,
        attempt_index: u32,
        attempt_retry: u32,
    },
    CancelTask {
        task_id: TaskId,
    },
    /// Audit record: an attempt left for the executors.
    TaskAttemptDispatched {
        task_id: TaskId,
        attempt_index: u32,
        attempt_retry: u32,
    },
}

impl TaskEngineMessage {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::DispatchTask { task_id, .. }
            | Self::RetryTaskAttempt { task_id }
            | Self::TaskAttemptStarted { task_id, .. }
            | Self::TaskAttemptCompleted { task_id, .. }
            | Self::TaskAttemptFailed { task_id, .. }
            | Self::TaskAttemptTimeoutCheck { task_id, .. }
            | Self::CancelTask { task_id }
            | Self::TaskAttemptDispatched { task_id, .. } => task_id,
        }
    }

    pub fn is_audit(&self) -> bool {
        matches!(self, Self::TaskAttemptDispatched { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::DispatchTask { .. } => "dispatch_task",
            Self::RetryTaskAttempt { .. } => "retry_task_attempt",
            Self::TaskAttemptStarted { .. } => "task_attempt_started",
            Self::TaskAttemptCompleted { .. } => "task_attempt_completed",
            Self::TaskAttemptFailed { .. } => "task_attempt_failed",
            Self::TaskAttemptTimeoutCheck { .. } => "task_attempt_timeout_check",
            Self::CancelTask { .. } => "cancel_task",
            Self::TaskAttemptDispatched { .. } => "task_attempt_dispatched",
        }
    }
}

/// One attempt handed to a task-executor worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttemptRequest {
    pub task_id: TaskId,
    pub task_name: TaskName,
    pub input: Vec<serde_json::Value>,
    pub attempt_index: u32,
    pub attempt_retry: u32,
}
