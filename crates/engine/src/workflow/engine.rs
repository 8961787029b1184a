//! The per-workflow state machine.
//!
//! One `handle` call per inbound message, addressed by workflow id. The
//! engine serializes concurrent completions through the
//! single-decision-in-flight rule: while a decision is outstanding every
//! other message is buffered and replayed, in arrival order, once the
//! decision lands.

use std::time::Duration;

use crate::data::branches::{Branch, BranchInput};
use crate::data::commands::{Command, CommandStatus};
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, EngineResult};
use crate::ids::{BranchId, BranchName, DecisionId, JobName};
use crate::messages::decisions::{DecisionPlan, DecisionRequest};
use crate::messages::{
    ClientNotification, JobStatus, MonitoringMessage, RetryPolicy, TaskEngineMessage,
    WorkflowEngineMessage,
};
use crate::storage::{PutOutcome, WorkflowStateStorage};
use crate::workflow::state::WorkflowEngineState;

/// Bounded reload-and-reapply attempts on a compare-on-write conflict.
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Attempt timeout handed to the task engine for decision-dispatched tasks.
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 300;

pub struct WorkflowEngine<S, D> {
    storage: S,
    dispatcher: D,
}

impl<S: WorkflowStateStorage, D: Dispatcher> WorkflowEngine<S, D> {
    pub fn new(storage: S, dispatcher: D) -> Self {
        Self { storage, dispatcher }
    }

    /// Process one inbound message to completion.
    ///
    /// Storage conflicts are retried by reloading and reapplying; all other
    /// errors bubble up to the caller (the runtime worker decides between
    /// ack and redelivery based on [`EngineError::is_fatal`]).
    pub async fn handle(&self, message: &WorkflowEngineMessage) -> EngineResult<()> {
        if message.is_audit() {
            tracing::trace!(
                workflow_id = %message.workflow_id(),
                kind = message.kind(),
                "discarding audit record"
            );
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match self.handle_once(message).await {
                Err(err) if err.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        workflow_id = %message.workflow_id(),
                        kind = message.kind(),
                        attempt,
                        "storage conflict, reapplying"
                    );
                }
                Err(err) if err.is_conflict() => {
                    tracing::error!(
                        workflow_id = %message.workflow_id(),
                        kind = message.kind(),
                        "storage conflict persisted after {MAX_CONFLICT_RETRIES} retries"
                    );
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    async fn handle_once(&self, message: &WorkflowEngineMessage) -> EngineResult<()> {
        let workflow_id = message.workflow_id();
        let old = self.storage.get(workflow_id).await?;

        let Some(old) = old else {
            // No state: either a birth message or a race against
            // termination. Both are expected under at-least-once delivery.
            return match message {
                WorkflowEngineMessage::DispatchWorkflow { .. } => {
                    self.dispatch_workflow(message).await
                }
                _ => {
                    tracing::trace!(
                        workflow_id = %workflow_id,
                        kind = message.kind(),
                        "discarding message for unknown or terminated workflow"
                    );
                    Ok(())
                }
            };
        };

        if matches!(message, WorkflowEngineMessage::DispatchWorkflow { .. }) {
            tracing::debug!(workflow_id = %workflow_id, "discarding duplicate dispatch");
            return Ok(());
        }

        // Single decision in flight: everything but the decision result
        // waits its turn.
        if old.ongoing_decision_id.is_some()
            && !matches!(message, WorkflowEngineMessage::DecisionCompleted { .. })
        {
            let mut new = old.clone();
            new.buffered_messages.push_back(message.clone());
            tracing::debug!(
                workflow_id = %workflow_id,
                kind = message.kind(),
                buffered = new.buffered_messages.len(),
                "decision in flight, buffering"
            );
            return self.persist(&old, new).await;
        }

        let mut new = old.clone();
        self.apply(&mut new, message.clone()).await?;

        // Drain buffered messages through a work-list, oldest first. A
        // message that opens a new decision stops the drain; the rest stay
        // buffered for the next decision result.
        while new.ongoing_decision_id.is_none() {
            let Some(buffered) = new.buffered_messages.pop_front() else {
                break;
            };
            self.apply(&mut new, buffered).await?;
        }

        self.persist(&old, new).await
    }

    /// Birth transition: no prior state exists.
    async fn dispatch_workflow(&self, message: &WorkflowEngineMessage) -> EngineResult<()> {
        let WorkflowEngineMessage::DispatchWorkflow {
            workflow_id,
            workflow_name,
            workflow_input,
            parent_workflow_id,
        } = message.clone()
        else {
            return Err(EngineError::ContractViolation(
                "dispatch_workflow called with a non-dispatch message".into(),
            ));
        };

        let mut state = WorkflowEngineState::new(
            workflow_id.clone(),
            workflow_name.clone(),
            parent_workflow_id,
        );
        state
            .running_branches
            .push(Branch::new(BranchName::from("handle"), workflow_input));

        self.start_decision(&mut state).await?;

        self.dispatcher
            .to_monitoring(MonitoringMessage::JobStatusUpdated {
                job_name: JobName::from(workflow_name.as_str()),
                old_status: None,
                new_status: JobStatus::RunningOk,
            })
            .await?;

        match self.storage.put(&workflow_id, &state, None).await? {
            PutOutcome::Applied => {
                tracing::info!(workflow_id = %workflow_id, workflow_name = %workflow_name, "workflow dispatched");
                Ok(())
            }
            PutOutcome::Conflict => {
                // Another worker created the same id first; this delivery is
                // a duplicate and the side effects above are tolerated
                // downstream.
                tracing::debug!(workflow_id = %workflow_id, "concurrent create, discarding duplicate dispatch");
                Ok(())
            }
        }
    }

    /// Apply one message to the loaded state, dispatching follow-ups.
    async fn apply(
        &self,
        state: &mut WorkflowEngineState,
        message: WorkflowEngineMessage,
    ) -> EngineResult<()> {
        match message {
            WorkflowEngineMessage::DecisionCompleted {
                decision_id, plan, ..
            } => self.decision_completed(state, decision_id, plan).await,
            WorkflowEngineMessage::TaskCompleted {
                task_id, output, ..
            } => {
                let satisfied = state
                    .running_branches
                    .iter_mut()
                    .any(|b| b.complete_task(&task_id, output.clone()));
                self.after_completion(state, satisfied).await
            }
            WorkflowEngineMessage::TaskCanceled { task_id, .. } => {
                // A canceled task unblocks its wait with an empty output so
                // the workflow logic can observe it.
                let satisfied = state
                    .running_branches
                    .iter_mut()
                    .any(|b| b.complete_task(&task_id, serde_json::Value::Null));
                self.after_completion(state, satisfied).await
            }
            WorkflowEngineMessage::ChildWorkflowCompleted {
                child_workflow_id,
                output,
                ..
            } => {
                let satisfied = state
                    .running_branches
                    .iter_mut()
                    .any(|b| b.complete_child_workflow(&child_workflow_id, output.clone()));
                self.after_completion(state, satisfied).await
            }
            WorkflowEngineMessage::ChildWorkflowCanceled {
                child_workflow_id, ..
            } => {
                let satisfied = state.running_branches.iter_mut().any(|b| {
                    b.complete_child_workflow(&child_workflow_id, serde_json::Value::Null)
                });
                self.after_completion(state, satisfied).await
            }
            WorkflowEngineMessage::DelayCompleted { delay_id, .. } => {
                let satisfied = state
                    .running_branches
                    .iter_mut()
                    .any(|b| b.complete_delay(&delay_id));
                self.after_completion(state, satisfied).await
            }
            WorkflowEngineMessage::EventReceived {
                event_name,
                payload,
                ..
            } => {
                let satisfied = state
                    .running_branches
                    .iter_mut()
                    .any(|b| b.complete_event(&event_name, payload.clone()));
                self.after_completion(state, satisfied).await
            }
            WorkflowEngineMessage::CancelWorkflow { .. } => self.cancel_workflow(state).await,
            WorkflowEngineMessage::DispatchWorkflow { .. }
            | WorkflowEngineMessage::DecisionDispatched { .. }
            | WorkflowEngineMessage::TaskDispatched { .. }
            | WorkflowEngineMessage::WorkflowCompleted { .. }
            | WorkflowEngineMessage::WorkflowCanceled { .. } => {
                Err(EngineError::ContractViolation(format!(
                    "message kind {} cannot reach the transition handler",
                    message.kind()
                )))
            }
        }
    }

    async fn after_completion(
        &self,
        state: &mut WorkflowEngineState,
        satisfied: bool,
    ) -> EngineResult<()> {
        if satisfied {
            self.start_decision(state).await?;
        }
        Ok(())
    }

    /// Open a new decision cycle: allocate the id, GC the store, ship the
    /// snapshot to the deciders and record the dispatch on the audit trail.
    async fn start_decision(&self, state: &mut WorkflowEngineState) -> EngineResult<()> {
        let decision_id = DecisionId::new();
        state.ongoing_decision_id = Some(decision_id.clone());
        state.property_store = state.property_store.filter(&state.running_branches);

        let request = DecisionRequest {
            decision_id: decision_id.clone(),
            workflow_id: state.workflow_id.clone(),
            workflow_name: state.workflow_name.clone(),
            branches: state.running_branches.clone(),
            store: state.property_store.clone(),
        };
        self.dispatcher.to_deciders(request).await?;

        self.dispatcher
            .to_workflow_engine(
                WorkflowEngineMessage::DecisionDispatched {
                    workflow_id: state.workflow_id.clone(),
                    decision_id,
                },
                Duration::ZERO,
            )
            .await
    }

    /// Merge the decider's plan into the state.
    ///
    /// Commands are matched by id; an existing COMPLETED command wins over
    /// the plan's copy so completions that raced the decision are never
    /// undone. Plan commands unknown to the branch are new: their side
    /// effect is dispatched here, exactly once.
    async fn decision_completed(
        &self,
        state: &mut WorkflowEngineState,
        decision_id: DecisionId,
        plan: DecisionPlan,
    ) -> EngineResult<()> {
        match &state.ongoing_decision_id {
            Some(current) if current == &decision_id => {}
            _ => {
                tracing::debug!(
                    workflow_id = %state.workflow_id,
                    decision_id = %decision_id,
                    "discarding stale decision result"
                );
                return Ok(());
            }
        }
        state.ongoing_decision_id = None;

        for value in plan.new_properties.into_values() {
            state.property_store.insert(value);
        }

        let workflow_id = state.workflow_id.clone();
        let mut new_commands: Vec<Command> = Vec::new();
        let mut terminated: Vec<(BranchId, Option<serde_json::Value>)> = Vec::new();

        for branch_plan in plan.branches {
            let Some(branch) = state.branch_mut(&branch_plan.branch_id) else {
                tracing::debug!(
                    workflow_id = %workflow_id,
                    branch_id = %branch_plan.branch_id,
                    "plan for a branch that no longer runs, skipping"
                );
                continue;
            };

            let mut merged = Vec::with_capacity(branch_plan.commands.len());
            for planned in branch_plan.commands {
                match branch.commands.iter().find(|c| c.key() == planned.key()) {
                    Some(existing) if existing.status() == CommandStatus::Completed => {
                        merged.push(existing.clone());
                    }
                    Some(_) => merged.push(planned),
                    None => {
                        new_commands.push(planned.clone());
                        merged.push(planned);
                    }
                }
            }
            branch.commands = merged;
            branch.steps = branch_plan.steps;
            branch.current_properties = branch_plan.properties;

            if branch_plan.terminated {
                terminated.push((branch.branch_id.clone(), branch_plan.output));
            }
        }

        for command in new_commands {
            self.dispatch_command(state, command).await?;
        }

        let mut workflow_output = None;
        for (branch_id, output) in terminated {
            state.running_branches.retain(|b| b.branch_id != branch_id);
            workflow_output = workflow_output.or(output);
        }

        state.property_store = state.property_store.filter(&state.running_branches);

        if state.running_branches.is_empty() {
            self.workflow_completed(state, workflow_output).await?;
        }
        Ok(())
    }

    /// Side effect of one newly-planned command.
    async fn dispatch_command(
        &self,
        state: &WorkflowEngineState,
        command: Command,
    ) -> EngineResult<()> {
        match command {
            Command::DispatchTask {
                task_id,
                task_name,
                input,
                ..
            } => {
                self.dispatcher
                    .to_task_engine(
                        TaskEngineMessage::DispatchTask {
                            task_id: task_id.clone(),
                            task_name,
                            input,
                            workflow_id: Some(state.workflow_id.clone()),
                            retry: RetryPolicy::default(),
                            attempt_timeout_secs: DEFAULT_ATTEMPT_TIMEOUT_SECS,
                        },
                        Duration::ZERO,
                    )
                    .await?;
                self.dispatcher
                    .to_workflow_engine(
                        WorkflowEngineMessage::TaskDispatched {
                            workflow_id: state.workflow_id.clone(),
                            task_id,
                        },
                        Duration::ZERO,
                    )
                    .await
            }
            Command::DispatchChildWorkflow {
                child_workflow_id,
                workflow_name,
                input,
                ..
            } => {
                self.dispatcher
                    .to_workflow_engine(
                        WorkflowEngineMessage::DispatchWorkflow {
                            workflow_id: child_workflow_id,
                            workflow_name,
                            workflow_input: BranchInput(input),
                            parent_workflow_id: Some(state.workflow_id.clone()),
                        },
                        Duration::ZERO,
                    )
                    .await
            }
            Command::WaitDelay {
                delay_id,
                duration_secs,
                ..
            } => {
                // The timer is the transport's delayed delivery, nothing
                // in-process.
                self.dispatcher
                    .to_workflow_engine(
                        WorkflowEngineMessage::DelayCompleted {
                            workflow_id: state.workflow_id.clone(),
                            delay_id,
                        },
                        Duration::from_secs(duration_secs),
                    )
                    .await
            }
            // The wait registration is the command itself.
            Command::WaitEvent { .. } => Ok(()),
        }
    }

    async fn workflow_completed(
        &self,
        state: &WorkflowEngineState,
        output: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        tracing::info!(workflow_id = %state.workflow_id, "workflow completed");

        if let Some(parent_workflow_id) = &state.parent_workflow_id {
            self.dispatcher
                .to_workflow_engine(
                    WorkflowEngineMessage::ChildWorkflowCompleted {
                        workflow_id: parent_workflow_id.clone(),
                        child_workflow_id: state.workflow_id.clone(),
                        output: output.clone().unwrap_or(serde_json::Value::Null),
                    },
                    Duration::ZERO,
                )
                .await?;
        }

        self.dispatcher
            .to_client(ClientNotification::WorkflowCompleted {
                workflow_id: state.workflow_id.clone(),
            })
            .await?;
        self.dispatcher
            .to_monitoring(MonitoringMessage::JobStatusUpdated {
                job_name: JobName::from(state.workflow_name.as_str()),
                old_status: Some(JobStatus::RunningOk),
                new_status: JobStatus::TerminatedCompleted,
            })
            .await?;
        self.dispatcher
            .to_workflow_engine(
                WorkflowEngineMessage::WorkflowCompleted {
                    workflow_id: state.workflow_id.clone(),
                },
                Duration::ZERO,
            )
            .await
    }

    /// Cancel every running branch and its outstanding work.
    ///
    /// Reached directly when idle, or through the buffer when a decision is
    /// in flight, so a cancellation is never lost mid-decision.
    async fn cancel_workflow(&self, state: &mut WorkflowEngineState) -> EngineResult<()> {
        for branch in &state.running_branches {
            for command in branch.ongoing_commands() {
                match command {
                    Command::DispatchTask { task_id, .. } => {
                        self.dispatcher
                            .to_task_engine(
                                TaskEngineMessage::CancelTask {
                                    task_id: task_id.clone(),
                                },
                                Duration::ZERO,
                            )
                            .await?;
                    }
                    Command::DispatchChildWorkflow {
                        child_workflow_id, ..
                    } => {
                        self.dispatcher
                            .to_workflow_engine(
                                WorkflowEngineMessage::CancelWorkflow {
                                    workflow_id: child_workflow_id.clone(),
                                },
                                Duration::ZERO,
                            )
                            .await?;
                    }
                    Command::WaitDelay { .. } | Command::WaitEvent { .. } => {}
                }
            }
        }

        state.running_branches.clear();

        if let Some(parent_workflow_id) = &state.parent_workflow_id {
            self.dispatcher
                .to_workflow_engine(
                    WorkflowEngineMessage::ChildWorkflowCanceled {
                        workflow_id: parent_workflow_id.clone(),
                        child_workflow_id: state.workflow_id.clone(),
                    },
                    Duration::ZERO,
                )
                .await?;
        }

        self.dispatcher
            .to_client(ClientNotification::WorkflowCanceled {
                workflow_id: state.workflow_id.clone(),
            })
            .await?;
        self.dispatcher
            .to_monitoring(MonitoringMessage::JobStatusUpdated {
                job_name: JobName::from(state.workflow_name.as_str()),
                old_status: Some(JobStatus::RunningOk),
                new_status: JobStatus::TerminatedCanceled,
            })
            .await?;
        self.dispatcher
            .to_workflow_engine(
                WorkflowEngineMessage::WorkflowCanceled {
                    workflow_id: state.workflow_id.clone(),
                },
                Duration::ZERO,
            )
            .await?;

        tracing::info!(workflow_id = %state.workflow_id, "workflow canceled");
        Ok(())
    }

    /// Persist the transition: delete terminated state, write changed state
    /// behind the old-value fence, skip unchanged state.
    async fn persist(
        &self,
        old: &WorkflowEngineState,
        new: WorkflowEngineState,
    ) -> EngineResult<()> {
        if new.is_terminated() {
            return self.storage.delete(&new.workflow_id).await;
        }
        if &new == old {
            return Ok(());
        }
        match self
            .storage
            .put(&new.workflow_id, &new, Some(old))
            .await?
        {
            PutOutcome::Applied => Ok(()),
            PutOutcome::Conflict => Err(EngineError::Conflict {
                key: new.workflow_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::properties::{Properties, PropertyValue};
    use crate::data::steps::{Step, WaitTree};
    use crate::ids::{EventId, EventName, PropertyName, TaskId, TaskName, WorkflowId, WorkflowName};
    use crate::memory::{MemoryDispatcher, MemoryStorage};
    use crate::messages::decisions::BranchPlan;
    use crate::messages::ClientNotification;
    use crate::storage::WorkflowStateStorage;
    use std::collections::HashMap;
    use std::sync::Arc;

    type TestEngine = WorkflowEngine<Arc<MemoryStorage>, Arc<MemoryDispatcher>>;

    fn engine() -> (TestEngine, Arc<MemoryStorage>, Arc<MemoryDispatcher>) {
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());
        (
            WorkflowEngine::new(storage.clone(), dispatcher.clone()),
            storage,
            dispatcher,
        )
    }

    fn dispatch_message(id: &str) -> WorkflowEngineMessage {
        WorkflowEngineMessage::DispatchWorkflow {
            workflow_id: WorkflowId::from(id),
            workflow_name: WorkflowName::from("order"),
            workflow_input: BranchInput(vec![serde_json::json!(42)]),
            parent_workflow_id: None,
        }
    }

    /// Dispatch a workflow and return the decision request it produced.
    async fn dispatch(engine: &TestEngine, dispatcher: &MemoryDispatcher, id: &str) -> DecisionRequest {
        engine.handle(&dispatch_message(id)).await.unwrap();
        let mut decisions = dispatcher.take_decisions();
        assert_eq!(decisions.len(), 1);
        dispatcher.take_workflow_messages();
        dispatcher.take_monitoring_messages();
        decisions.pop().unwrap()
    }

    fn plan_with_task(request: &DecisionRequest, task_id: &TaskId) -> DecisionPlan {
        let branch = &request.branches[0];
        DecisionPlan {
            new_properties: HashMap::new(),
            branches: vec![BranchPlan {
                branch_id: branch.branch_id.clone(),
                terminated: false,
                output: None,
                commands: vec![Command::DispatchTask {
                    task_id: task_id.clone(),
                    task_name: TaskName::from("charge"),
                    input: vec![],
                    status: CommandStatus::Ongoing,
                    output: None,
                }],
                steps: vec![Step::new(WaitTree::task(task_id.clone()))],
                properties: Properties::new(),
            }],
        }
    }

    fn decision_completed(request: &DecisionRequest, plan: DecisionPlan) -> WorkflowEngineMessage {
        WorkflowEngineMessage::DecisionCompleted {
            workflow_id: request.workflow_id.clone(),
            decision_id: request.decision_id.clone(),
            plan,
        }
    }

    #[tokio::test]
    async fn test_dispatch_creates_state_and_decision() {
        let (engine, storage, dispatcher) = engine();

        engine.handle(&dispatch_message("w-1")).await.unwrap();

        let state = storage
            .get(&WorkflowId::from("w-1"))
            .await
            .unwrap()
            .expect("state persisted");
        assert!(state.ongoing_decision_id.is_some());
        assert_eq!(state.running_branches.len(), 1);
        assert_eq!(
            state.running_branches[0].branch_input.0,
            vec![serde_json::json!(42)]
        );

        let decisions = dispatcher.take_decisions();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].branches.len(), 1);

        // Audit record of the dispatch went to our own topic.
        let audits = dispatcher.take_workflow_messages();
        assert!(audits
            .iter()
            .any(|(m, _)| matches!(m, WorkflowEngineMessage::DecisionDispatched { .. })));
    }

    #[tokio::test]
    async fn test_audit_records_are_discarded() {
        let (engine, storage, _dispatcher) = engine();
        engine
            .handle(&WorkflowEngineMessage::WorkflowCompleted {
                workflow_id: WorkflowId::from("w-1"),
            })
            .await
            .unwrap();
        assert_eq!(storage.workflow_count(), 0);
    }

    #[tokio::test]
    async fn test_message_for_unknown_workflow_is_discarded() {
        let (engine, storage, dispatcher) = engine();
        engine
            .handle(&WorkflowEngineMessage::TaskCompleted {
                workflow_id: WorkflowId::from("w-ghost"),
                task_id: TaskId::from("t-1"),
                output: serde_json::Value::Null,
            })
            .await
            .unwrap();
        assert_eq!(storage.workflow_count(), 0);
        assert!(dispatcher.take_decisions().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_dispatch_is_discarded() {
        let (engine, storage, dispatcher) = engine();
        let _request = dispatch(&engine, &dispatcher, "w-1").await;
        let before = storage.get(&WorkflowId::from("w-1")).await.unwrap();

        engine.handle(&dispatch_message("w-1")).await.unwrap();

        assert_eq!(storage.get(&WorkflowId::from("w-1")).await.unwrap(), before);
        assert!(dispatcher.take_decisions().is_empty());
    }

    #[tokio::test]
    async fn test_messages_buffer_while_decision_in_flight() {
        let (engine, storage, dispatcher) = engine();
        let _request = dispatch(&engine, &dispatcher, "w-1").await;

        engine
            .handle(&WorkflowEngineMessage::EventReceived {
                workflow_id: WorkflowId::from("w-1"),
                event_name: EventName::from("payment-settled"),
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let state = storage
            .get(&WorkflowId::from("w-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.buffered_messages.len(), 1);
        // Mutual exclusion: no second decision was opened.
        assert!(dispatcher.take_decisions().is_empty());
    }

    #[tokio::test]
    async fn test_empty_decision_terminates_workflow() {
        let (engine, storage, dispatcher) = engine();
        let request = dispatch(&engine, &dispatcher, "w-1").await;

        let plan =
            DecisionPlan::terminate_all(request.branches.iter().map(|b| b.branch_id.clone()));
        engine
            .handle(&decision_completed(&request, plan))
            .await
            .unwrap();

        assert_eq!(storage.workflow_count(), 0);
        assert!(dispatcher
            .take_client_notifications()
            .iter()
            .any(|n| matches!(n, ClientNotification::WorkflowCompleted { .. })));
        assert!(dispatcher
            .take_workflow_messages()
            .iter()
            .any(|(m, _)| matches!(m, WorkflowEngineMessage::WorkflowCompleted { .. })));
    }

    #[tokio::test]
    async fn test_decision_plan_dispatches_new_task() {
        let (engine, storage, dispatcher) = engine();
        let request = dispatch(&engine, &dispatcher, "w-1").await;
        let task_id = TaskId::from("t-1");

        engine
            .handle(&decision_completed(&request, plan_with_task(&request, &task_id)))
            .await
            .unwrap();

        let task_messages = dispatcher.take_task_messages();
        assert!(task_messages
            .iter()
            .any(|(m, _)| matches!(m, TaskEngineMessage::DispatchTask { task_id: id, .. } if id == &task_id)));
        assert!(dispatcher
            .take_workflow_messages()
            .iter()
            .any(|(m, _)| matches!(m, WorkflowEngineMessage::TaskDispatched { .. })));

        let state = storage
            .get(&WorkflowId::from("w-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(state.ongoing_decision_id.is_none());
        assert_eq!(state.running_branches[0].ongoing_commands().count(), 1);
    }

    #[tokio::test]
    async fn test_task_completion_opens_new_decision() {
        let (engine, storage, dispatcher) = engine();
        let request = dispatch(&engine, &dispatcher, "w-1").await;
        let task_id = TaskId::from("t-1");
        engine
            .handle(&decision_completed(&request, plan_with_task(&request, &task_id)))
            .await
            .unwrap();
        dispatcher.take_task_messages();
        dispatcher.take_workflow_messages();

        engine
            .handle(&WorkflowEngineMessage::TaskCompleted {
                workflow_id: WorkflowId::from("w-1"),
                task_id,
                output: serde_json::json!("receipt"),
            })
            .await
            .unwrap();

        let state = storage
            .get(&WorkflowId::from("w-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(state.ongoing_decision_id.is_some());
        assert_eq!(dispatcher.take_decisions().len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_task_completion_changes_nothing() {
        let (engine, storage, dispatcher) = engine();
        let request = dispatch(&engine, &dispatcher, "w-1").await;
        engine
            .handle(&decision_completed(
                &request,
                plan_with_task(&request, &TaskId::from("t-1")),
            ))
            .await
            .unwrap();
        dispatcher.take_task_messages();
        dispatcher.take_workflow_messages();
        let before = storage.get(&WorkflowId::from("w-1")).await.unwrap();

        engine
            .handle(&WorkflowEngineMessage::TaskCompleted {
                workflow_id: WorkflowId::from("w-1"),
                task_id: TaskId::from("t-unrelated"),
                output: serde_json::Value::Null,
            })
            .await
            .unwrap();

        assert_eq!(storage.get(&WorkflowId::from("w-1")).await.unwrap(), before);
        assert!(dispatcher.take_decisions().is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_completion_is_idempotent() {
        let (engine, storage, dispatcher) = engine();
        let request = dispatch(&engine, &dispatcher, "w-1").await;
        let task_id = TaskId::from("t-1");
        engine
            .handle(&decision_completed(&request, plan_with_task(&request, &task_id)))
            .await
            .unwrap();
        dispatcher.take_task_messages();
        dispatcher.take_workflow_messages();

        let completion = WorkflowEngineMessage::TaskCompleted {
            workflow_id: WorkflowId::from("w-1"),
            task_id,
            output: serde_json::json!("receipt"),
        };
        engine.handle(&completion).await.unwrap();
        dispatcher.take_decisions();
        dispatcher.take_workflow_messages();
        let after_first = storage.get(&WorkflowId::from("w-1")).await.unwrap();

        // Same logical message again: the command is already COMPLETED, the
        // ongoing decision buffers and then drops it as a no-op.
        engine.handle(&completion).await.unwrap();
        let state = storage
            .get(&WorkflowId::from("w-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.buffered_messages.len(), 1);
        assert_eq!(
            state.ongoing_decision_id,
            after_first.as_ref().unwrap().ongoing_decision_id
        );
        assert!(dispatcher.take_decisions().is_empty());
    }

    #[tokio::test]
    async fn test_buffered_messages_drain_in_order_after_decision() {
        let (engine, storage, dispatcher) = engine();
        let request = dispatch(&engine, &dispatcher, "w-1").await;

        // Two events arrive while the decision is in flight.
        for payload in [1, 2] {
            engine
                .handle(&WorkflowEngineMessage::EventReceived {
                    workflow_id: WorkflowId::from("w-1"),
                    event_name: EventName::from("tick"),
                    payload: serde_json::json!(payload),
                })
                .await
                .unwrap();
        }

        // The decision plan waits on the first event only.
        let branch = &request.branches[0];
        let event_id = EventId::from("e-1");
        let plan = DecisionPlan {
            new_properties: HashMap::new(),
            branches: vec![BranchPlan {
                branch_id: branch.branch_id.clone(),
                terminated: false,
                output: None,
                commands: vec![Command::WaitEvent {
                    event_id: event_id.clone(),
                    event_name: EventName::from("tick"),
                    status: CommandStatus::Ongoing,
                    payload: None,
                }],
                steps: vec![Step::new(WaitTree::event(event_id))],
                properties: Properties::new(),
            }],
        };
        engine
            .handle(&decision_completed(&request, plan))
            .await
            .unwrap();

        let state = storage
            .get(&WorkflowId::from("w-1"))
            .await
            .unwrap()
            .unwrap();
        // First buffered event satisfied the wait and opened a decision; the
        // second stayed buffered for the next cycle.
        assert!(state.ongoing_decision_id.is_some());
        assert_eq!(state.buffered_messages.len(), 1);
        let second_request = dispatcher.take_decisions().pop().unwrap();
        let event_payload = match &second_request.branches[0].commands[0] {
            Command::WaitEvent { payload, .. } => payload.clone(),
            other => panic!("unexpected command {other:?}"),
        };
        assert_eq!(event_payload, Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn test_cancel_while_decision_in_flight_is_not_lost() {
        let (engine, storage, dispatcher) = engine();
        let request = dispatch(&engine, &dispatcher, "w-1").await;

        engine
            .handle(&WorkflowEngineMessage::CancelWorkflow {
                workflow_id: WorkflowId::from("w-1"),
            })
            .await
            .unwrap();
        // Still alive: the cancellation waits for the decision.
        assert_eq!(storage.workflow_count(), 1);

        let task_id = TaskId::from("t-1");
        engine
            .handle(&decision_completed(&request, plan_with_task(&request, &task_id)))
            .await
            .unwrap();

        // Decision applied, then the buffered cancellation: task canceled,
        // state gone.
        assert_eq!(storage.workflow_count(), 0);
        assert!(dispatcher
            .take_task_messages()
            .iter()
            .any(|(m, _)| matches!(m, TaskEngineMessage::CancelTask { task_id: id } if id == &task_id)));
        assert!(dispatcher
            .take_client_notifications()
            .iter()
            .any(|n| matches!(n, ClientNotification::WorkflowCanceled { .. })));
    }

    #[tokio::test]
    async fn test_delay_command_schedules_delayed_self_message() {
        let (engine, _storage, dispatcher) = engine();
        let request = dispatch(&engine, &dispatcher, "w-1").await;

        let branch = &request.branches[0];
        let delay_id = crate::ids::DelayId::from("d-1");
        let plan = DecisionPlan {
            new_properties: HashMap::new(),
            branches: vec![BranchPlan {
                branch_id: branch.branch_id.clone(),
                terminated: false,
                output: None,
                commands: vec![Command::WaitDelay {
                    delay_id: delay_id.clone(),
                    duration_secs: 90,
                    status: CommandStatus::Ongoing,
                }],
                steps: vec![Step::new(WaitTree::delay(delay_id.clone()))],
                properties: Properties::new(),
            }],
        };
        engine
            .handle(&decision_completed(&request, plan))
            .await
            .unwrap();

        let sent = dispatcher.take_workflow_messages();
        let delayed = sent
            .iter()
            .find(|(m, _)| matches!(m, WorkflowEngineMessage::DelayCompleted { delay_id: id, .. } if id == &delay_id))
            .expect("delay scheduled");
        assert_eq!(delayed.1, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_child_workflow_dispatch_carries_parent() {
        let (engine, _storage, dispatcher) = engine();
        let request = dispatch(&engine, &dispatcher, "w-parent").await;

        let branch = &request.branches[0];
        let child_id = WorkflowId::from("w-child");
        let plan = DecisionPlan {
            new_properties: HashMap::new(),
            branches: vec![BranchPlan {
                branch_id: branch.branch_id.clone(),
                terminated: false,
                output: None,
                commands: vec![Command::DispatchChildWorkflow {
                    child_workflow_id: child_id.clone(),
                    workflow_name: WorkflowName::from("refund"),
                    input: vec![],
                    status: CommandStatus::Ongoing,
                    output: None,
                }],
                steps: vec![Step::new(WaitTree::child_workflow(child_id.clone()))],
                properties: Properties::new(),
            }],
        };
        engine
            .handle(&decision_completed(&request, plan))
            .await
            .unwrap();

        let sent = dispatcher.take_workflow_messages();
        let dispatched = sent
            .iter()
            .find_map(|(m, _)| match m {
                WorkflowEngineMessage::DispatchWorkflow {
                    workflow_id,
                    parent_workflow_id,
                    ..
                } if workflow_id == &child_id => Some(parent_workflow_id.clone()),
                _ => None,
            })
            .expect("child dispatched");
        assert_eq!(dispatched, Some(WorkflowId::from("w-parent")));
    }

    #[tokio::test]
    async fn test_child_completion_notifies_parent() {
        let (engine, storage, dispatcher) = engine();
        engine
            .handle(&WorkflowEngineMessage::DispatchWorkflow {
                workflow_id: WorkflowId::from("w-child"),
                workflow_name: WorkflowName::from("refund"),
                workflow_input: BranchInput::default(),
                parent_workflow_id: Some(WorkflowId::from("w-parent")),
            })
            .await
            .unwrap();
        let request = dispatcher.take_decisions().pop().unwrap();
        dispatcher.take_workflow_messages();
        dispatcher.take_monitoring_messages();

        let mut plan =
            DecisionPlan::terminate_all(request.branches.iter().map(|b| b.branch_id.clone()));
        plan.branches[0].output = Some(serde_json::json!("refunded"));
        engine
            .handle(&decision_completed(&request, plan))
            .await
            .unwrap();

        assert_eq!(storage.workflow_count(), 0);
        let sent = dispatcher.take_workflow_messages();
        assert!(sent.iter().any(|(m, _)| matches!(
            m,
            WorkflowEngineMessage::ChildWorkflowCompleted {
                workflow_id,
                child_workflow_id,
                output,
            } if workflow_id == &WorkflowId::from("w-parent")
                && child_workflow_id == &WorkflowId::from("w-child")
                && output == &serde_json::json!("refunded")
        )));
    }

    #[tokio::test]
    async fn test_gc_keeps_decision_properties_reachable() {
        let (engine, storage, dispatcher) = engine();
        let request = dispatch(&engine, &dispatcher, "w-1").await;

        let value = PropertyValue::new(serde_json::json!({"total": 99}));
        let hash = value.hash();
        let mut new_properties = HashMap::new();
        new_properties.insert(PropertyName::from("invoice"), value);
        let mut properties = Properties::new();
        properties.0.insert(PropertyName::from("invoice"), hash.clone());

        let task_id = TaskId::from("t-1");
        let plan = DecisionPlan {
            new_properties,
            branches: vec![BranchPlan {
                branch_id: request.branches[0].branch_id.clone(),
                terminated: false,
                output: None,
                commands: vec![Command::DispatchTask {
                    task_id: task_id.clone(),
                    task_name: TaskName::from("charge"),
                    input: vec![],
                    status: CommandStatus::Ongoing,
                    output: None,
                }],
                steps: vec![Step::new(WaitTree::task(task_id))],
                properties,
            }],
        };
        engine
            .handle(&decision_completed(&request, plan))
            .await
            .unwrap();

        let state = storage
            .get(&WorkflowId::from("w-1"))
            .await
            .unwrap()
            .unwrap();
        // Referenced by the branch's current mapping: survives the GC.
        assert!(state.property_store.contains(&hash));
        assert_eq!(state.property_store.len(), 1);
    }

    /// Storage that reports a bounded number of spurious conflicts.
    struct FlakyStorage {
        inner: Arc<MemoryStorage>,
        conflicts: std::sync::Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl WorkflowStateStorage for FlakyStorage {
        async fn get(
            &self,
            workflow_id: &WorkflowId,
        ) -> EngineResult<Option<WorkflowEngineState>> {
            self.inner.get(workflow_id).await
        }

        async fn put(
            &self,
            workflow_id: &WorkflowId,
            new: &WorkflowEngineState,
            expected_old: Option<&WorkflowEngineState>,
        ) -> EngineResult<PutOutcome> {
            let is_conflict = {
                let mut conflicts = self.conflicts.lock().unwrap();
                if *conflicts > 0 {
                    *conflicts -= 1;
                    true
                } else {
                    false
                }
            };
            if is_conflict {
                return Ok(PutOutcome::Conflict);
            }
            self.inner.put(workflow_id, new, expected_old).await
        }

        async fn delete(&self, workflow_id: &WorkflowId) -> EngineResult<()> {
            self.inner.delete(workflow_id).await
        }
    }

    fn deciding_state(id: &str) -> WorkflowEngineState {
        let mut s =
            WorkflowEngineState::new(WorkflowId::from(id), WorkflowName::from("order"), None);
        s.ongoing_decision_id = Some(DecisionId::from("d-1"));
        s
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_until_applied() {
        let memory = Arc::new(MemoryStorage::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());
        let storage = Arc::new(FlakyStorage {
            inner: memory.clone(),
            conflicts: std::sync::Mutex::new(2),
        });
        let engine = WorkflowEngine::new(storage, dispatcher.clone());

        memory
            .put(&WorkflowId::from("w-1"), &deciding_state("w-1"), None)
            .await
            .unwrap();

        engine
            .handle(&WorkflowEngineMessage::EventReceived {
                workflow_id: WorkflowId::from("w-1"),
                event_name: EventName::from("tick"),
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let state = memory
            .get(&WorkflowId::from("w-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.buffered_messages.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_surface_after_bounded_retries() {
        let memory = Arc::new(MemoryStorage::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());
        let storage = Arc::new(FlakyStorage {
            inner: memory.clone(),
            conflicts: std::sync::Mutex::new(MAX_CONFLICT_RETRIES + 10),
        });
        let engine = WorkflowEngine::new(storage, dispatcher.clone());

        memory
            .put(&WorkflowId::from("w-1"), &deciding_state("w-1"), None)
            .await
            .unwrap();

        let err = engine
            .handle(&WorkflowEngineMessage::EventReceived {
                workflow_id: WorkflowId::from("w-1"),
                event_name: EventName::from("tick"),
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_stale_decision_result_is_discarded() {
        let (engine, storage, dispatcher) = engine();
        let request = dispatch(&engine, &dispatcher, "w-1").await;
        let before = storage.get(&WorkflowId::from("w-1")).await.unwrap();

        let stale = WorkflowEngineMessage::DecisionCompleted {
            workflow_id: request.workflow_id.clone(),
            decision_id: DecisionId::from("d-stale"),
            plan: DecisionPlan::terminate_all(vec![]),
        };
        engine.handle(&stale).await.unwrap();

        assert_eq!(storage.get(&WorkflowId::from("w-1")).await.unwrap(), before);
    }
}
