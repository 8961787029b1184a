//! Messages addressed to the workflow engine.
//!
//! The enum is the wire envelope: a tagged union carrying the target
//! workflow id. Audit kinds are records of the engine's own past actions,
//! published for external trails and discarded on receipt.

use serde::{Deserialize, Serialize};

use crate::data::branches::BranchInput;
use crate::ids::{DecisionId, DelayId, EventName, TaskId, WorkflowId, WorkflowName};
use crate::messages::decisions::DecisionPlan;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEngineMessage {
    /// Create and start a new workflow. The only kind valid without state.
    DispatchWorkflow {
        workflow_id: WorkflowId,
        workflow_name: WorkflowName,
        workflow_input: BranchInput,
        /// Set when this workflow was dispatched as a child.
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_workflow_id: Option<WorkflowId>,
    },
    /// The decider returned a plan for the outstanding decision.
    DecisionCompleted {
        workflow_id: WorkflowId,
        decision_id: DecisionId,
        plan: DecisionPlan,
    },
    TaskCompleted {
        workflow_id: WorkflowId,
        task_id: TaskId,
        output: serde_json::Value,
    },
    TaskCanceled {
        workflow_id: WorkflowId,
        task_id: TaskId,
    },
    ChildWorkflowCompleted {
        workflow_id: WorkflowId,
        child_workflow_id: WorkflowId,
        output: serde_json::Value,
    },
    ChildWorkflowCanceled {
        workflow_id: WorkflowId,
        child_workflow_id: WorkflowId,
    },
    DelayCompleted {
        workflow_id: WorkflowId,
        delay_id: DelayId,
    },
    EventReceived {
        workflow_id: WorkflowId,
        event_name: EventName,
        payload: serde_json::Value,
    },
    CancelWorkflow {
        workflow_id: WorkflowId,
    },
    /// Audit record: a decision request left for the deciders.
    DecisionDispatched {
        workflow_id: WorkflowId,
        decision_id: DecisionId,
    },
    /// Audit record: a task was handed to the task engine.
    TaskDispatched {
        workflow_id: WorkflowId,
        task_id: TaskId,
    },
    /// Audit record: the workflow reached its end.
    WorkflowCompleted {
        workflow_id: WorkflowId,
    },
    /// Audit record: the workflow was canceled.
    WorkflowCanceled {
        workflow_id: WorkflowId,
    },
}

impl WorkflowEngineMessage {
    /// The workflow this message is addressed to.
    pub fn workflow_id(&self) -> &WorkflowId {
        match self {
            Self::DispatchWorkflow { workflow_id, .. }
            | Self::DecisionCompleted { workflow_id, .. }
            | Self::TaskCompleted { workflow_id, .. }
            | Self::TaskCanceled { workflow_id, .. }
            | Self::ChildWorkflowCompleted { workflow_id, .. }
            | Self::ChildWorkflowCanceled { workflow_id, .. }
            | Self::DelayCompleted { workflow_id, .. }
            | Self::EventReceived { workflow_id, .. }
            | Self::CancelWorkflow { workflow_id }
            | Self::DecisionDispatched { workflow_id, .. }
            | Self::TaskDispatched { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id }
            | Self::WorkflowCanceled { workflow_id } => workflow_id,
        }
    }

    /// Pure echo/audit records, discarded before any state load.
    pub fn is_audit(&self) -> bool {
        matches!(
            self,
            Self::DecisionDispatched { .. }
                | Self::TaskDispatched { .. }
                | Self::WorkflowCompleted { .. }
                | Self::WorkflowCanceled { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::DispatchWorkflow { .. } => "dispatch_workflow",
            Self::DecisionCompleted { .. } => "decision_completed",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskCanceled { .. } => "task_canceled",
            Self::ChildWorkflowCompleted { .. } => "child_workflow_completed",
            Self::ChildWorkflowCanceled { .. } => "child_workflow_canceled",
            Self::DelayCompleted { .. } => "delay_completed",
            Self::EventReceived { .. } => "event_received",
            Self::CancelWorkflow { .. } => "cancel_workflow",
            Self::DecisionDispatched { .. } => "decision_dispatched",
            Self::TaskDispatched { .. } => "task_dispatched",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowCanceled { .. } => "workflow_canceled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_kinds() {
        let id = WorkflowId::from("w-1");
        assert!(WorkflowEngineMessage::WorkflowCompleted {
            workflow_id: id.clone()
        }
        .is_audit());
        assert!(!WorkflowEngineMessage::CancelWorkflow { workflow_id: id }.is_audit());
    }

    #[test]
    fn test_serde_tag_matches_kind() {
        let msg = WorkflowEngineMessage::DelayCompleted {
            workflow_id: WorkflowId::from("w-1"),
            delay_id: DelayId::from("d-1"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], msg.kind());
        assert_eq!(json["workflow_id"], "w-1");
    }

    #[test]
    fn test_envelope_roundtrip() {
        let msg = WorkflowEngineMessage::EventReceived {
            workflow_id: WorkflowId::from("w-1"),
            event_name: EventName::from("shipment-scanned"),
            payload: serde_json::json!({"dock": 4}),
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: WorkflowEngineMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
    }
}
