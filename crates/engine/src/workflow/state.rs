//! Persistent state of one workflow, owned exclusively by the workflow
//! engine.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::data::branches::Branch;
use crate::data::properties::PropertyStore;
use crate::ids::{DecisionId, WorkflowId, WorkflowName};
use crate::messages::WorkflowEngineMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEngineState {
    pub workflow_id: WorkflowId,
    pub workflow_name: WorkflowName,
    /// Set when this workflow runs as a child of another workflow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_workflow_id: Option<WorkflowId>,
    /// Non-null while a decision request is outstanding. At most one
    /// decision exists per workflow at any time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ongoing_decision_id: Option<DecisionId>,
    pub running_branches: Vec<Branch>,
    /// Messages that arrived while a decision was in flight, FIFO.
    pub buffered_messages: VecDeque<WorkflowEngineMessage>,
    pub property_store: PropertyStore,
}

impl WorkflowEngineState {
    pub fn new(
        workflow_id: WorkflowId,
        workflow_name: WorkflowName,
        parent_workflow_id: Option<WorkflowId>,
    ) -> Self {
        Self {
            workflow_id,
            workflow_name,
            parent_workflow_id,
            ongoing_decision_id: None,
            running_branches: Vec::new(),
            buffered_messages: VecDeque::new(),
            property_store: PropertyStore::new(),
        }
    }

    /// No outstanding decision and no running branch: the workflow is over
    /// and its record must be deleted, not retained.
    pub fn is_terminated(&self) -> bool {
        self.ongoing_decision_id.is_none() && self.running_branches.is_empty()
    }

    pub fn branch_mut(&mut self, branch_id: &crate::ids::BranchId) -> Option<&mut Branch> {
        self.running_branches
            .iter_mut()
            .find(|b| &b.branch_id == branch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::branches::{Branch, BranchInput};
    use crate::ids::BranchName;

    #[test]
    fn test_fresh_state_is_terminated() {
        let state = WorkflowEngineState::new(
            WorkflowId::from("w-1"),
            WorkflowName::from("order"),
            None,
        );
        assert!(state.is_terminated());
    }

    #[test]
    fn test_running_branch_keeps_state_alive() {
        let mut state = WorkflowEngineState::new(
            WorkflowId::from("w-1"),
            WorkflowName::from("order"),
            None,
        );
        state
            .running_branches
            .push(Branch::new(BranchName::from("handle"), BranchInput::default()));
        assert!(!state.is_terminated());
    }

    #[test]
    fn test_ongoing_decision_keeps_state_alive() {
        let mut state = WorkflowEngineState::new(
            WorkflowId::from("w-1"),
            WorkflowName::from("order"),
            None,
        );
        state.ongoing_decision_id = Some(crate::ids::DecisionId::new());
        assert!(!state.is_terminated());
    }
}
