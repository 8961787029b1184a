//! Decision request/response payloads exchanged with the decider workers.
//!
//! A decision is one invocation of the user's workflow logic against a
//! snapshot of branches and properties. The engine only dispatches requests
//! and consumes plans; the computation itself is external.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::data::branches::Branch;
use crate::data::commands::Command;
use crate::data::properties::{Properties, PropertyStore, PropertyValue};
use crate::data::steps::Step;
use crate::ids::{BranchId, DecisionId, PropertyName, WorkflowId, WorkflowName};

/// Snapshot handed to a decider worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub decision_id: DecisionId,
    pub workflow_id: WorkflowId,
    pub workflow_name: WorkflowName,
    /// Running branches as of the decision, in dispatch order.
    pub branches: Vec<Branch>,
    /// Property store filtered to the branches above.
    pub store: PropertyStore,
}

/// What the decider produced for one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchPlan {
    pub branch_id: BranchId,
    /// The branch logic ran to its end; the branch is removed.
    pub terminated: bool,
    /// Result of a terminated branch, forwarded to a waiting parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Command list as of this decision. Commands unknown to the engine are
    /// new and get their side effect dispatched exactly once.
    pub commands: Vec<Command>,
    /// Replacement wait-tree.
    pub steps: Vec<Step>,
    /// Property mapping visible after this decision.
    pub properties: Properties,
}

/// Full plan returned by the decider for one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPlan {
    /// Values captured during the decision, keyed by name; hashed into the
    /// workflow's property store on apply.
    #[serde(default)]
    pub new_properties: HashMap<PropertyName, PropertyValue>,
    pub branches: Vec<BranchPlan>,
}

impl DecisionPlan {
    /// A plan that terminates every given branch with no further commands.
    pub fn terminate_all(branch_ids: impl IntoIterator<Item = BranchId>) -> Self {
        Self {
            new_properties: HashMap::new(),
            branches: branch_ids
                .into_iter()
                .map(|branch_id| BranchPlan {
                    branch_id,
                    terminated: true,
                    output: None,
                    commands: Vec::new(),
                    steps: Vec::new(),
                    properties: Properties::new(),
                })
                .collect(),
        }
    }
}
