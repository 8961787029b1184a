//! One concurrently-executing branch of a workflow run.
//!
//! A branch records the input it was dispatched with, snapshots of the
//! property mapping, the wait-tree produced by the last decision, and the
//! commands that decision dispatched. Completion methods mark the matching
//! ONGOING command, propagate into the current step, and report whether the
//! branch is ready for a new decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::commands::{Command, CommandStatus};
use crate::data::properties::Properties;
use crate::data::steps::Step;
use crate::ids::{BranchId, BranchName, DelayId, EventName, TaskId, WorkflowId};

/// Ordered serialized parameters a branch was dispatched with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchInput(pub Vec<serde_json::Value>);

/// One running branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: BranchId,
    pub branch_name: BranchName,
    pub branch_input: BranchInput,
    /// Property mapping when the branch was dispatched.
    pub properties_at_start: Properties,
    /// Property mapping as updated by the latest decision.
    pub current_properties: Properties,
    pub dispatched_at: DateTime<Utc>,
    /// Wait-tree produced by the last decision, in order.
    pub steps: Vec<Step>,
    /// Commands dispatched by the last decision.
    pub commands: Vec<Command>,
}

impl Branch {
    pub fn new(branch_name: BranchName, branch_input: BranchInput) -> Self {
        Self {
            branch_id: BranchId::new(),
            branch_name,
            branch_input,
            properties_at_start: Properties::new(),
            current_properties: Properties::new(),
            dispatched_at: Utc::now(),
            steps: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Mark the matching ongoing task command completed and propagate into
    /// the current step. Returns whether the branch is now satisfied.
    pub fn complete_task(&mut self, task_id: &TaskId, output: serde_json::Value) -> bool {
        let found = self.commands.iter_mut().find(|c| {
            matches!(c, Command::DispatchTask { task_id: id, .. } if id == task_id)
                && c.is_ongoing()
        });
        if let Some(command) = found {
            if let Command::DispatchTask {
                output: slot,
                status,
                ..
            } = command
            {
                *slot = Some(output);
                *status = CommandStatus::Completed;
            }
        }

        let properties = self.current_properties.clone();
        self.current_step()
            .map(|step| step.complete_task(task_id, &properties))
            .unwrap_or(false)
    }

    /// Same as [`complete_task`](Self::complete_task) for a child workflow.
    pub fn complete_child_workflow(
        &mut self,
        child_workflow_id: &WorkflowId,
        output: serde_json::Value,
    ) -> bool {
        let found = self.commands.iter_mut().find(|c| {
            matches!(
                c,
                Command::DispatchChildWorkflow { child_workflow_id: id, .. } if id == child_workflow_id
            ) && c.is_ongoing()
        });
        if let Some(command) = found {
            if let Command::DispatchChildWorkflow {
                output: slot,
                status,
                ..
            } = command
            {
                *slot = Some(output);
                *status = CommandStatus::Completed;
            }
        }

        let properties = self.current_properties.clone();
        self.current_step()
            .map(|step| step.complete_child_workflow(child_workflow_id, &properties))
            .unwrap_or(false)
    }

    /// Mark an elapsed delay completed.
    pub fn complete_delay(&mut self, delay_id: &DelayId) -> bool {
        let found = self.commands.iter_mut().find(|c| {
            matches!(c, Command::WaitDelay { delay_id: id, .. } if id == delay_id)
                && c.is_ongoing()
        });
        if let Some(command) = found {
            command.set_completed();
        }

        let properties = self.current_properties.clone();
        self.current_step()
            .map(|step| step.complete_delay(delay_id, &properties))
            .unwrap_or(false)
    }

    /// Deliver an external event by name.
    ///
    /// Events address commands by name, not id; the id of the matched wait
    /// command is then used against the step tree. No matching ongoing
    /// command means the event is not awaited: nothing changes.
    pub fn complete_event(&mut self, event_name: &EventName, payload: serde_json::Value) -> bool {
        let found = self.commands.iter_mut().find(|c| {
            matches!(c, Command::WaitEvent { event_name: name, .. } if name == event_name)
                && c.is_ongoing()
        });

        let Some(Command::WaitEvent {
            event_id,
            payload: slot,
            status,
            ..
        }) = found
        else {
            return false;
        };
        *slot = Some(payload);
        *status = CommandStatus::Completed;
        let event_id = event_id.clone();

        let properties = self.current_properties.clone();
        self.current_step()
            .map(|step| step.complete_event(&event_id, &properties))
            .unwrap_or(false)
    }

    /// Commands still awaiting completion.
    pub fn ongoing_commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter().filter(|c| c.is_ongoing())
    }

    fn current_step(&mut self) -> Option<&mut Step> {
        self.steps.last_mut()
    }
}
