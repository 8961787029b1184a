//! Side-effecting commands dispatched by a decision.
//!
//! A command transitions ONGOING -> COMPLETED at most once; completing an
//! already-completed command is a no-op. That property is what makes the
//! engines idempotent under at-least-once delivery.

use serde::{Deserialize, Serialize};

use crate::ids::{DelayId, EventId, EventName, TaskId, TaskName, WorkflowId, WorkflowName};

/// Lifecycle of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Ongoing,
    Completed,
}

/// One side effect requested by a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    DispatchTask {
        task_id: TaskId,
        task_name: TaskName,
        input: Vec<serde_json::Value>,
        status: CommandStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
    },
    DispatchChildWorkflow {
        child_workflow_id: WorkflowId,
        workflow_name: WorkflowName,
        input: Vec<serde_json::Value>,
        status: CommandStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
    },
    WaitDelay {
        delay_id: DelayId,
        duration_secs: u64,
        status: CommandStatus,
    },
    WaitEvent {
        event_id: EventId,
        event_name: EventName,
        status: CommandStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
}

impl Command {
    pub fn status(&self) -> CommandStatus {
        match self {
            Command::DispatchTask { status, .. }
            | Command::DispatchChildWorkflow { status, .. }
            | Command::WaitDelay { status, .. }
            | Command::WaitEvent { status, .. } => *status,
        }
    }

    pub fn is_ongoing(&self) -> bool {
        self.status() == CommandStatus::Ongoing
    }

    /// Stable identity used when merging a decision plan into a branch.
    pub fn key(&self) -> &str {
        match self {
            Command::DispatchTask { task_id, .. } => task_id.as_str(),
            Command::DispatchChildWorkflow {
                child_workflow_id, ..
            } => child_workflow_id.as_str(),
            Command::WaitDelay { delay_id, .. } => delay_id.as_str(),
            Command::WaitEvent { event_id, .. } => event_id.as_str(),
        }
    }

    pub(crate) fn set_completed(&mut self) {
        match self {
            Command::DispatchTask { status, .. }
            | Command::DispatchChildWorkflow { status, .. }
            | Command::WaitDelay { status, .. }
            | Command::WaitEvent { status, .. } => *status = CommandStatus::Completed,
        }
    }
}
