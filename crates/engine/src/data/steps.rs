//! Wait-trees: which completions a branch is blocked on.
//!
//! A `Step` mirrors one suspension point of the workflow's control flow.
//! Its tree combines task/child-workflow/delay/event leaves with `All` and
//! `Any` nodes. Completion methods mark the matching leaf and report whether
//! the whole step is now satisfied; the first satisfaction snapshots the
//! property mapping visible at that point for the reachability GC.

use serde::{Deserialize, Serialize};

use crate::data::properties::Properties;
use crate::ids::{DelayId, EventId, TaskId, WorkflowId};

/// A node of the wait-tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitTree {
    Task { task_id: TaskId, completed: bool },
    ChildWorkflow { workflow_id: WorkflowId, completed: bool },
    Delay { delay_id: DelayId, completed: bool },
    Event { event_id: EventId, completed: bool },
    All { children: Vec<WaitTree> },
    Any { children: Vec<WaitTree> },
}

impl WaitTree {
    pub fn task(task_id: TaskId) -> Self {
        WaitTree::Task {
            task_id,
            completed: false,
        }
    }

    pub fn child_workflow(workflow_id: WorkflowId) -> Self {
        WaitTree::ChildWorkflow {
            workflow_id,
            completed: false,
        }
    }

    pub fn delay(delay_id: DelayId) -> Self {
        WaitTree::Delay {
            delay_id,
            completed: false,
        }
    }

    pub fn event(event_id: EventId) -> Self {
        WaitTree::Event {
            event_id,
            completed: false,
        }
    }

    pub fn all(children: Vec<WaitTree>) -> Self {
        WaitTree::All { children }
    }

    pub fn any(children: Vec<WaitTree>) -> Self {
        WaitTree::Any { children }
    }

    /// Whether this subtree is satisfied.
    pub fn is_satisfied(&self) -> bool {
        match self {
            WaitTree::Task { completed, .. }
            | WaitTree::ChildWorkflow { completed, .. }
            | WaitTree::Delay { completed, .. }
            | WaitTree::Event { completed, .. } => *completed,
            WaitTree::All { children } => children.iter().all(WaitTree::is_satisfied),
            WaitTree::Any { children } => children.iter().any(WaitTree::is_satisfied),
        }
    }

    fn mark(&mut self, target: &Waiting) -> bool {
        match (self, target) {
            (WaitTree::Task { task_id, completed }, Waiting::Task(id)) if *task_id == **id => {
                let newly = !*completed;
                *completed = true;
                newly
            }
            (
                WaitTree::ChildWorkflow {
                    workflow_id,
                    completed,
                },
                Waiting::ChildWorkflow(id),
            ) if *workflow_id == **id => {
                let newly = !*completed;
                *completed = true;
                newly
            }
            (WaitTree::Delay { delay_id, completed }, Waiting::Delay(id))
                if *delay_id == **id =>
            {
                let newly = !*completed;
                *completed = true;
                newly
            }
            (WaitTree::Event { event_id, completed }, Waiting::Event(id))
                if *event_id == **id =>
            {
                let newly = !*completed;
                *completed = true;
                newly
            }
            (WaitTree::All { children }, target) | (WaitTree::Any { children }, target) => {
                let mut marked = false;
                for child in children {
                    marked |= child.mark(target);
                }
                marked
            }
            _ => false,
        }
    }
}

/// What a leaf is waiting for.
enum Waiting<'a> {
    Task(&'a TaskId),
    ChildWorkflow(&'a WorkflowId),
    Delay(&'a DelayId),
    Event(&'a EventId),
}

/// One suspension point of a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub tree: WaitTree,
    /// Property mapping snapshotted when the step first became satisfied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties_after_completion: Option<Properties>,
}

impl Step {
    pub fn new(tree: WaitTree) -> Self {
        Self {
            tree,
            properties_after_completion: None,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.tree.is_satisfied()
    }

    pub fn complete_task(&mut self, task_id: &TaskId, properties: &Properties) -> bool {
        self.complete(&Waiting::Task(task_id), properties)
    }

    pub fn complete_child_workflow(
        &mut self,
        workflow_id: &WorkflowId,
        properties: &Properties,
    ) -> bool {
        self.complete(&Waiting::ChildWorkflow(workflow_id), properties)
    }

    pub fn complete_delay(&mut self, delay_id: &DelayId, properties: &Properties) -> bool {
        self.complete(&Waiting::Delay(delay_id), properties)
    }

    pub fn complete_event(&mut self, event_id: &EventId, properties: &Properties) -> bool {
        self.complete(&Waiting::Event(event_id), properties)
    }

    fn complete(&mut self, target: &Waiting, properties: &Properties) -> bool {
        if !self.tree.mark(target) {
            return false;
        }
        let satisfied = self.tree.is_satisfied();
        if satisfied && self.properties_after_completion.is_none() {
            self.properties_after_completion = Some(properties.clone());
        }
        satisfied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::properties::PropertyValue;
    use crate::ids::PropertyName;

    fn props() -> Properties {
        let mut p = Properties::new();
        p.0.insert(
            PropertyName::from("total"),
            PropertyValue::new(serde_json::json!(3)).hash(),
        );
        p
    }

    #[test]
    fn test_single_leaf_satisfies() {
        let id = TaskId::from("t-1");
        let mut step = Step::new(WaitTree::task(id.clone()));
        assert!(!step.is_satisfied());
        assert!(step.complete_task(&id, &props()));
        assert!(step.is_satisfied());
        assert!(step.properties_after_completion.is_some());
    }

    #[test]
    fn test_all_requires_every_child() {
        let t = TaskId::from("t-1");
        let d = DelayId::from("d-1");
        let mut step = Step::new(WaitTree::all(vec![
            WaitTree::task(t.clone()),
            WaitTree::delay(d.clone()),
        ]));

        assert!(!step.complete_task(&t, &props()));
        assert!(!step.is_satisfied());
        assert!(step.complete_delay(&d, &props()));
        assert!(step.is_satisfied());
    }

    #[test]
    fn test_any_satisfied_by_first_child() {
        let t = TaskId::from("t-1");
        let e = EventId::from("e-1");
        let mut step = Step::new(WaitTree::any(vec![
            WaitTree::task(t.clone()),
            WaitTree::event(e),
        ]));

        assert!(step.complete_task(&t, &props()));
        assert!(step.is_satisfied());
    }

    #[test]
    fn test_unrelated_completion_does_not_mark() {
        let mut step = Step::new(WaitTree::task(TaskId::from("t-1")));
        assert!(!step.complete_task(&TaskId::from("t-other"), &props()));
        assert!(!step.is_satisfied());
    }

    #[test]
    fn test_duplicate_completion_does_not_resatisfy() {
        let id = TaskId::from("t-1");
        let mut step = Step::new(WaitTree::task(id.clone()));
        assert!(step.complete_task(&id, &props()));

        // Redelivery: the leaf is already marked, nothing changes.
        assert!(!step.complete_task(&id, &props()));
        assert!(step.is_satisfied());
    }

    #[test]
    fn test_snapshot_taken_once() {
        let t1 = TaskId::from("t-1");
        let e1 = EventId::from("e-1");
        let mut step = Step::new(WaitTree::any(vec![
            WaitTree::task(t1.clone()),
            WaitTree::event(e1.clone()),
        ]));

        let first = props();
        assert!(step.complete_task(&t1, &first));
        let snapshot = step.properties_after_completion.clone();

        // A later completion of the other arm must not overwrite the snapshot.
        step.complete_event(&e1, &Properties::new());
        assert_eq!(step.properties_after_completion, snapshot);
    }

    #[test]
    fn test_nested_combinators() {
        let t1 = TaskId::from("t-1");
        let t2 = TaskId::from("t-2");
        let d = DelayId::from("d-1");
        let mut step = Step::new(WaitTree::all(vec![
            WaitTree::any(vec![WaitTree::task(t1.clone()), WaitTree::task(t2)]),
            WaitTree::delay(d.clone()),
        ]));

        assert!(!step.complete_task(&t1, &props()));
        assert!(step.complete_delay(&d, &props()));
    }
}
