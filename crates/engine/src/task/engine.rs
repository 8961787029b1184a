//! The per-task state machine.
//!
//! Simpler peer of the workflow engine: forwards attempts to the executors,
//! consumes attempt lifecycle notifications, schedules delayed retries with
//! backoff, and propagates terminal outcomes upward to the owning workflow.

use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, EngineResult};
use crate::ids::JobName;
use crate::messages::{
    ClientNotification, JobStatus, MonitoringMessage, TaskAttemptRequest, TaskEngineMessage,
    WorkflowEngineMessage,
};
use crate::storage::{PutOutcome, TaskStateStorage};
use crate::task::state::{TaskState, TaskStatus};
use crate::workflow::engine::MAX_CONFLICT_RETRIES;

pub struct TaskEngine<S, D> {
    storage: S,
    dispatcher: D,
}

impl<S: TaskStateStorage, D: Dispatcher> TaskEngine<S, D> {
    pub fn new(storage: S, dispatcher: D) -> Self {
        Self { storage, dispatcher }
    }

    /// Process one inbound message to completion, retrying storage
    /// conflicts by reloading and reapplying.
    pub async fn handle(&self, message: &TaskEngineMessage) -> EngineResult<()> {
        if message.is_audit() {
            tracing::trace!(task_id = %message.task_id(), kind = message.kind(), "discarding audit record");
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match self.handle_once(message).await {
                Err(err) if err.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        task_id = %message.task_id(),
                        kind = message.kind(),
                        attempt,
                        "storage conflict, reapplying"
                    );
                }
                Err(err) if err.is_conflict() => {
                    tracing::error!(
                        task_id = %message.task_id(),
                        kind = message.kind(),
                        "storage conflict persisted after {MAX_CONFLICT_RETRIES} retries"
                    );
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    async fn handle_once(&self, message: &TaskEngineMessage) -> EngineResult<()> {
        let task_id = message.task_id();
        let old = self.storage.get(task_id).await?;

        let Some(old) = old else {
            return match message {
                TaskEngineMessage::DispatchTask { .. } => self.dispatch_task(message).await,
                _ => {
                    tracing::trace!(
                        task_id = %task_id,
                        kind = message.kind(),
                        "discarding message for unknown or terminated task"
                    );
                    Ok(())
                }
            };
        };

        if matches!(message, TaskEngineMessage::DispatchTask { .. }) {
            tracing::debug!(task_id = %task_id, "discarding duplicate dispatch");
            return Ok(());
        }

        let mut new = old.clone();
        match message {
            TaskEngineMessage::RetryTaskAttempt { .. } => {
                self.retry_attempt(&mut new).await?;
            }
            TaskEngineMessage::TaskAttemptStarted {
                attempt_index,
                attempt_retry,
                ..
            } => {
                tracing::debug!(
                    task_id = %task_id,
                    attempt_index,
                    attempt_retry,
                    "attempt started"
                );
            }
            TaskEngineMessage::TaskAttemptCompleted {
                attempt_index,
                attempt_retry,
                output,
                ..
            } => {
                if !new.matches_attempt(*attempt_index, *attempt_retry) {
                    tracing::debug!(task_id = %task_id, "discarding stale attempt completion");
                } else {
                    self.complete_task(&mut new, output.clone()).await?;
                }
            }
            TaskEngineMessage::TaskAttemptFailed {
                attempt_index,
                attempt_retry,
                error,
                ..
            } => {
                if !new.matches_attempt(*attempt_index, *attempt_retry)
                    || new.status != TaskStatus::Ongoing
                {
                    tracing::debug!(task_id = %task_id, "discarding stale attempt failure");
                } else {
                    self.fail_attempt(&mut new, error.clone()).await?;
                }
            }
            TaskEngineMessage::TaskAttemptTimeoutCheck {
                attempt_index,
                attempt_retry,
                ..
            } => {
                // Only meaningful while the very attempt it was scheduled
                // for is still running.
                if new.matches_attempt(*attempt_index, *attempt_retry)
                    && new.status == TaskStatus::Ongoing
                {
                    tracing::warn!(task_id = %task_id, attempt_index, "attempt timed out");
                    self.fail_attempt(&mut new, "attempt timed out".to_string())
                        .await?;
                }
            }
            TaskEngineMessage::CancelTask { .. } => {
                self.cancel_task(&mut new).await?;
            }
            TaskEngineMessage::DispatchTask { .. }
            | TaskEngineMessage::TaskAttemptDispatched { .. } => {
                return Err(EngineError::ContractViolation(format!(
                    "message kind {} cannot reach the transition handler",
                    message.kind()
                )));
            }
        }

        self.persist(&old, new).await
    }

    /// Birth transition: no prior state exists.
    async fn dispatch_task(&self, message: &TaskEngineMessage) -> EngineResult<()> {
        let TaskEngineMessage::DispatchTask {
            task_id,
            task_name,
            input,
            workflow_id,
            retry,
            attempt_timeout_secs,
        } = message.clone()
        else {
            return Err(EngineError::ContractViolation(
                "dispatch_task called with a non-dispatch message".into(),
            ));
        };

        let state = TaskState {
            task_id: task_id.clone(),
            task_name,
            workflow_id,
            status: TaskStatus::Ongoing,
            attempt_index: 0,
            attempt_retry: 0,
            input,
            retry,
            attempt_timeout_secs,
            last_error: None,
        };

        self.send_attempt(&state).await?;
        self.report_status(&state, None, JobStatus::RunningOk).await?;

        match self.storage.put(&task_id, &state, None).await? {
            PutOutcome::Applied => {
                tracing::info!(task_id = %task_id, task_name = %state.task_name, "task dispatched");
                Ok(())
            }
            PutOutcome::Conflict => {
                tracing::debug!(task_id = %task_id, "concurrent create, discarding duplicate dispatch");
                Ok(())
            }
        }
    }

    /// Hand the current attempt to the executors, with audit record and
    /// timeout check.
    async fn send_attempt(&self, state: &TaskState) -> EngineResult<()> {
        self.dispatcher
            .to_task_executors(TaskAttemptRequest {
                task_id: state.task_id.clone(),
                task_name: state.task_name.clone(),
                input: state.input.clone(),
                attempt_index: state.attempt_index,
                attempt_retry: state.attempt_retry,
            })
            .await?;

        self.dispatcher
            .to_task_engine(
                TaskEngineMessage::TaskAttemptDispatched {
                    task_id: state.task_id.clone(),
                    attempt_index: state.attempt_index,
                    attempt_retry: state.attempt_retry,
                },
                Duration::ZERO,
            )
            .await?;

        // The timeout is an ordinary delayed message, not an engine timer.
        self.dispatcher
            .to_task_engine(
                TaskEngineMessage::TaskAttemptTimeoutCheck {
                    task_id: state.task_id.clone(),
                    attempt_index: state.attempt_index,
                    attempt_retry: state.attempt_retry,
                },
                Duration::from_secs(state.attempt_timeout_secs),
            )
            .await
    }

    async fn retry_attempt(&self, state: &mut TaskState) -> EngineResult<()> {
        match state.status {
            TaskStatus::FailedAwaitingRetry => {
                // Scheduled automatic retry firing.
                let old_bucket = state.status.job_status();
                state.status = TaskStatus::Ongoing;
                self.send_attempt(state).await?;
                self.report_status(state, Some(old_bucket), JobStatus::RunningOk)
                    .await
            }
            TaskStatus::Failed => {
                // Operator-driven retry of a terminally-failed task: a fresh
                // attempt with its own retry budget.
                state.attempt_index += 1;
                state.attempt_retry = 0;
                state.status = TaskStatus::Ongoing;
                state.last_error = None;
                self.send_attempt(state).await?;
                self.report_status(state, Some(JobStatus::RunningError), JobStatus::RunningOk)
                    .await
            }
            _ => {
                tracing::debug!(task_id = %state.task_id, "discarding retry for a running task");
                Ok(())
            }
        }
    }

    async fn fail_attempt(&self, state: &mut TaskState, error: String) -> EngineResult<()> {
        state.last_error = Some(error.clone());

        if state.attempt_retry < state.retry.max_retries {
            let delay = state.retry.delay_for(state.attempt_retry);
            state.attempt_retry += 1;
            state.status = TaskStatus::FailedAwaitingRetry;

            self.dispatcher
                .to_task_engine(
                    TaskEngineMessage::RetryTaskAttempt {
                        task_id: state.task_id.clone(),
                    },
                    delay,
                )
                .await?;
            self.report_status(state, Some(JobStatus::RunningOk), JobStatus::RunningWarning)
                .await?;

            tracing::info!(
                task_id = %state.task_id,
                attempt_retry = state.attempt_retry,
                delay_secs = delay.as_secs(),
                error = %error,
                "attempt failed, retry scheduled"
            );
            return Ok(());
        }

        // Retry budget exhausted.
        state.status = TaskStatus::Failed;
        self.report_status(state, Some(JobStatus::RunningOk), JobStatus::RunningError)
            .await?;
        self.dispatcher
            .to_client(ClientNotification::TaskFailed {
                task_id: state.task_id.clone(),
                error: error.clone(),
            })
            .await?;

        tracing::error!(task_id = %state.task_id, error = %error, "task failed, retry budget exhausted");
        Ok(())
    }

    async fn complete_task(
        &self,
        state: &mut TaskState,
        output: serde_json::Value,
    ) -> EngineResult<()> {
        let old_bucket = state.status.job_status();
        state.status = TaskStatus::Completed;

        if let Some(workflow_id) = &state.workflow_id {
            self.dispatcher
                .to_workflow_engine(
                    WorkflowEngineMessage::TaskCompleted {
                        workflow_id: workflow_id.clone(),
                        task_id: state.task_id.clone(),
                        output: output.clone(),
                    },
                    Duration::ZERO,
                )
                .await?;
        }

        self.dispatcher
            .to_client(ClientNotification::TaskCompleted {
                task_id: state.task_id.clone(),
                output,
            })
            .await?;
        self.report_status(state, Some(old_bucket), JobStatus::TerminatedCompleted)
            .await?;

        tracing::info!(task_id = %state.task_id, "task completed");
        Ok(())
    }

    async fn cancel_task(&self, state: &mut TaskState) -> EngineResult<()> {
        let old_bucket = state.status.job_status();
        state.status = TaskStatus::Canceled;

        if let Some(workflow_id) = &state.workflow_id {
            self.dispatcher
                .to_workflow_engine(
                    WorkflowEngineMessage::TaskCanceled {
                        workflow_id: workflow_id.clone(),
                        task_id: state.task_id.clone(),
                    },
                    Duration::ZERO,
                )
                .await?;
        }

        self.dispatcher
            .to_client(ClientNotification::TaskCanceled {
                task_id: state.task_id.clone(),
            })
            .await?;
        self.report_status(state, Some(old_bucket), JobStatus::TerminatedCanceled)
            .await?;

        tracing::info!(task_id = %state.task_id, "task canceled");
        Ok(())
    }

    async fn report_status(
        &self,
        state: &TaskState,
        old_status: Option<JobStatus>,
        new_status: JobStatus,
    ) -> EngineResult<()> {
        self.dispatcher
            .to_monitoring(MonitoringMessage::JobStatusUpdated {
                job_name: JobName::from(state.task_name.as_str()),
                old_status,
                new_status,
            })
            .await
    }

    async fn persist(&self, old: &TaskState, new: TaskState) -> EngineResult<()> {
        if new.is_terminal() {
            return self.storage.delete(&new.task_id).await;
        }
        if &new == old {
            return Ok(());
        }
        match self.storage.put(&new.task_id, &new, Some(old)).await? {
            PutOutcome::Applied => Ok(()),
            PutOutcome::Conflict => Err(EngineError::Conflict {
                key: new.task_id.to_string(),
            }),
        }
    }
}
