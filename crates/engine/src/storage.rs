//! Storage contracts consumed by the engines.
//!
//! One record per entity, keyed for point lookups. The compare-on-write put
//! is mandatory: it is how a lost-update race between two workers briefly
//! processing the same entity is detected instead of silently overwritten.

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::ids::{JobName, TaskId, WorkflowId};
use crate::monitoring::MonitoringPerNameState;
use crate::task::TaskState;
use crate::workflow::WorkflowEngineState;

/// Outcome of a compare-on-write put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Applied,
    /// The stored value did not match `expected_old`.
    Conflict,
}

#[async_trait]
pub trait WorkflowStateStorage: Send + Sync {
    async fn get(&self, workflow_id: &WorkflowId) -> EngineResult<Option<WorkflowEngineState>>;

    /// Persist `new` only if the stored value still equals `expected_old`
    /// (`None` = the record must not exist yet).
    async fn put(
        &self,
        workflow_id: &WorkflowId,
        new: &WorkflowEngineState,
        expected_old: Option<&WorkflowEngineState>,
    ) -> EngineResult<PutOutcome>;

    async fn delete(&self, workflow_id: &WorkflowId) -> EngineResult<()>;
}

#[async_trait]
pub trait TaskStateStorage: Send + Sync {
    async fn get(&self, task_id: &TaskId) -> EngineResult<Option<TaskState>>;

    async fn put(
        &self,
        task_id: &TaskId,
        new: &TaskState,
        expected_old: Option<&TaskState>,
    ) -> EngineResult<PutOutcome>;

    async fn delete(&self, task_id: &TaskId) -> EngineResult<()>;
}

#[async_trait]
pub trait MonitoringStateStorage: Send + Sync {
    async fn get(&self, job_name: &JobName) -> EngineResult<Option<MonitoringPerNameState>>;

    async fn put(
        &self,
        job_name: &JobName,
        new: &MonitoringPerNameState,
        expected_old: Option<&MonitoringPerNameState>,
    ) -> EngineResult<PutOutcome>;

    async fn delete(&self, job_name: &JobName) -> EngineResult<()>;
}

#[async_trait]
impl<S: WorkflowStateStorage + ?Sized> WorkflowStateStorage for std::sync::Arc<S> {
    async fn get(&self, workflow_id: &WorkflowId) -> EngineResult<Option<WorkflowEngineState>> {
        (**self).get(workflow_id).await
    }

    async fn put(
        &self,
        workflow_id: &WorkflowId,
        new: &WorkflowEngineState,
        expected_old: Option<&WorkflowEngineState>,
    ) -> EngineResult<PutOutcome> {
        (**self).put(workflow_id, new, expected_old).await
    }

    async fn delete(&self, workflow_id: &WorkflowId) -> EngineResult<()> {
        (**self).delete(workflow_id).await
    }
}

#[async_trait]
impl<S: TaskStateStorage + ?Sized> TaskStateStorage for std::sync::Arc<S> {
    async fn get(&self, task_id: &TaskId) -> EngineResult<Option<TaskState>> {
        (**self).get(task_id).await
    }

    async fn put(
        &self,
        task_id: &TaskId,
        new: &TaskState,
        expected_old: Option<&TaskState>,
    ) -> EngineResult<PutOutcome> {
        (**self).put(task_id, new, expected_old).await
    }

    async fn delete(&self, task_id: &TaskId) -> EngineResult<()> {
        (**self).delete(task_id).await
    }
}

#[async_trait]
impl<S: MonitoringStateStorage + ?Sized> MonitoringStateStorage for std::sync::Arc<S> {
    async fn get(&self, job_name: &JobName) -> EngineResult<Option<MonitoringPerNameState>> {
        (**self).get(job_name).await
    }

    async fn put(
        &self,
        job_name: &JobName,
        new: &MonitoringPerNameState,
        expected_old: Option<&MonitoringPerNameState>,
    ) -> EngineResult<PutOutcome> {
        (**self).put(job_name, new, expected_old).await
    }

    async fn delete(&self, job_name: &JobName) -> EngineResult<()> {
        (**self).delete(job_name).await
    }
}

/// Debug-logging decorator; wraps any storage implementation.
pub struct Logged<S>(pub S);

#[async_trait]
impl<S: WorkflowStateStorage> WorkflowStateStorage for Logged<S> {
    async fn get(&self, workflow_id: &WorkflowId) -> EngineResult<Option<WorkflowEngineState>> {
        let state = self.0.get(workflow_id).await?;
        tracing::debug!(workflow_id = %workflow_id, found = state.is_some(), "get workflow state");
        Ok(state)
    }

    async fn put(
        &self,
        workflow_id: &WorkflowId,
        new: &WorkflowEngineState,
        expected_old: Option<&WorkflowEngineState>,
    ) -> EngineResult<PutOutcome> {
        let outcome = self.0.put(workflow_id, new, expected_old).await?;
        tracing::debug!(workflow_id = %workflow_id, ?outcome, "put workflow state");
        Ok(outcome)
    }

    async fn delete(&self, workflow_id: &WorkflowId) -> EngineResult<()> {
        tracing::debug!(workflow_id = %workflow_id, "delete workflow state");
        self.0.delete(workflow_id).await
    }
}

#[async_trait]
impl<S: TaskStateStorage> TaskStateStorage for Logged<S> {
    async fn get(&self, task_id: &TaskId) -> EngineResult<Option<TaskState>> {
        let state = self.0.get(task_id).await?;
        tracing::debug!(task_id = %task_id, found = state.is_some(), "get task state");
        Ok(state)
    }

    async fn put(
        &self,
        task_id: &TaskId,
        new: &TaskState,
        expected_old: Option<&TaskState>,
    ) -> EngineResult<PutOutcome> {
        let outcome = self.0.put(task_id, new, expected_old).await?;
        tracing::debug!(task_id = %task_id, ?outcome, "put task state");
        Ok(outcome)
    }

    async fn delete(&self, task_id: &TaskId) -> EngineResult<()> {
        tracing::debug!(task_id = %task_id, "delete task state");
        self.0.delete(task_id).await
    }
}

#[async_trait]
impl<S: MonitoringStateStorage> MonitoringStateStorage for Logged<S> {
    async fn get(&self, job_name: &JobName) -> EngineResult<Option<MonitoringPerNameState>> {
        let state = self.0.get(job_name).await?;
        tracing::debug!(job_name = %job_name, found = state.is_some(), "get monitoring state");
        Ok(state)
    }

    async fn put(
        &self,
        job_name: &JobName,
        new: &MonitoringPerNameState,
        expected_old: Option<&MonitoringPerNameState>,
    ) -> EngineResult<PutOutcome> {
        let outcome = self.0.put(job_name, new, expected_old).await?;
        tracing::debug!(job_name = %job_name, ?outcome, "put monitoring state");
        Ok(outcome)
    }

    async fn delete(&self, job_name: &JobName) -> EngineResult<()> {
        tracing::debug!(job_name = %job_name, "delete monitoring state");
        self.0.delete(job_name).await
    }
}
