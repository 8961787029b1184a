//! In-memory implementations of the storage and dispatcher contracts.
//!
//! Used by the unit tests and by local single-process runs. The storage
//! honors the same compare-on-write semantics as the durable backends.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::dispatcher::Dispatcher;
use crate::error::EngineResult;
use crate::ids::{JobName, TaskId, WorkflowId};
use crate::messages::{
    ClientNotification, DecisionRequest, MetricsEvent, MonitoringMessage, TaskAttemptRequest,
    TaskEngineMessage, WorkflowEngineMessage,
};
use crate::monitoring::MonitoringPerNameState;
use crate::storage::{
    MonitoringStateStorage, PutOutcome, TaskStateStorage, WorkflowStateStorage,
};
use crate::task::TaskState;
use crate::workflow::WorkflowEngineState;

fn fenced_put<K: std::hash::Hash + Eq + Clone, V: Clone + PartialEq>(
    map: &Mutex<HashMap<K, V>>,
    key: &K,
    new: &V,
    expected_old: Option<&V>,
) -> PutOutcome {
    let mut map = map.lock().expect("storage mutex poisoned");
    let matches = match (map.get(key), expected_old) {
        (None, None) => true,
        (Some(stored), Some(expected)) => stored == expected,
        _ => false,
    };
    if matches {
        map.insert(key.clone(), new.clone());
        PutOutcome::Applied
    } else {
        PutOutcome::Conflict
    }
}

/// Hash-map-backed storage for all three engine state kinds.
#[derive(Default)]
pub struct MemoryStorage {
    workflows: Mutex<HashMap<WorkflowId, WorkflowEngineState>>,
    tasks: Mutex<HashMap<TaskId, TaskState>>,
    monitoring: Mutex<HashMap<JobName, MonitoringPerNameState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.lock().expect("storage mutex poisoned").len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().expect("storage mutex poisoned").len()
    }
}

#[async_trait]
impl WorkflowStateStorage for MemoryStorage {
    async fn get(&self, workflow_id: &WorkflowId) -> EngineResult<Option<WorkflowEngineState>> {
        Ok(self
            .workflows
            .lock()
            .expect("storage mutex poisoned")
            .get(workflow_id)
            .cloned())
    }

    async fn put(
        &self,
        workflow_id: &WorkflowId,
        new: &WorkflowEngineState,
        expected_old: Option<&WorkflowEngineState>,
    ) -> EngineResult<PutOutcome> {
        Ok(fenced_put(&self.workflows, workflow_id, new, expected_old))
    }

    async fn delete(&self, workflow_id: &WorkflowId) -> EngineResult<()> {
        self.workflows
            .lock()
            .expect("storage mutex poisoned")
            .remove(workflow_id);
        Ok(())
    }
}

#[async_trait]
impl TaskStateStorage for MemoryStorage {
    async fn get(&self, task_id: &TaskId) -> EngineResult<Option<TaskState>> {
        Ok(self
            .tasks
            .lock()
            .expect("storage mutex poisoned")
            .get(task_id)
            .cloned())
    }

    async fn put(
        &self,
        task_id: &TaskId,
        new: &TaskState,
        expected_old: Option<&TaskState>,
    ) -> EngineResult<PutOutcome> {
        Ok(fenced_put(&self.tasks, task_id, new, expected_old))
    }

    async fn delete(&self, task_id: &TaskId) -> EngineResult<()> {
        self.tasks
            .lock()
            .expect("storage mutex poisoned")
            .remove(task_id);
        Ok(())
    }
}

#[async_trait]
impl MonitoringStateStorage for MemoryStorage {
    async fn get(&self, job_name: &JobName) -> EngineResult<Option<MonitoringPerNameState>> {
        Ok(self
            .monitoring
            .lock()
            .expect("storage mutex poisoned")
            .get(job_name)
            .cloned())
    }

    async fn put(
        &self,
        job_name: &JobName,
        new: &MonitoringPerNameState,
        expected_old: Option<&MonitoringPerNameState>,
    ) -> EngineResult<PutOutcome> {
        Ok(fenced_put(&self.monitoring, job_name, new, expected_old))
    }

    async fn delete(&self, job_name: &JobName) -> EngineResult<()> {
        self.monitoring
            .lock()
            .expect("storage mutex poisoned")
            .remove(job_name);
        Ok(())
    }
}

/// Dispatcher that records every send, for inspection by tests and for
/// draining into engines by the local runtime.
#[derive(Default)]
pub struct MemoryDispatcher {
    decisions: Mutex<Vec<DecisionRequest>>,
    executor_requests: Mutex<Vec<TaskAttemptRequest>>,
    workflow_messages: Mutex<Vec<(WorkflowEngineMessage, Duration)>>,
    task_messages: Mutex<Vec<(TaskEngineMessage, Duration)>>,
    monitoring_messages: Mutex<Vec<MonitoringMessage>>,
    client_notifications: Mutex<Vec<ClientNotification>>,
    metrics_events: Mutex<Vec<MetricsEvent>>,
}

impl MemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_decisions(&self) -> Vec<DecisionRequest> {
        std::mem::take(&mut self.decisions.lock().expect("dispatcher mutex poisoned"))
    }

    pub fn take_executor_requests(&self) -> Vec<TaskAttemptRequest> {
        std::mem::take(
            &mut self
                .executor_requests
                .lock()
                .expect("dispatcher mutex poisoned"),
        )
    }

    pub fn take_workflow_messages(&self) -> Vec<(WorkflowEngineMessage, Duration)> {
        std::mem::take(
            &mut self
                .workflow_messages
                .lock()
                .expect("dispatcher mutex poisoned"),
        )
    }

    pub fn take_task_messages(&self) -> Vec<(TaskEngineMessage, Duration)> {
        std::mem::take(
            &mut self
                .task_messages
                .lock()
                .expect("dispatcher mutex poisoned"),
        )
    }

    pub fn take_monitoring_messages(&self) -> Vec<MonitoringMessage> {
        std::mem::take(
            &mut self
                .monitoring_messages
                .lock()
                .expect("dispatcher mutex poisoned"),
        )
    }

    pub fn take_client_notifications(&self) -> Vec<ClientNotification> {
        std::mem::take(
            &mut self
                .client_notifications
                .lock()
                .expect("dispatcher mutex poisoned"),
        )
    }

    pub fn take_metrics_events(&self) -> Vec<MetricsEvent> {
        std::mem::take(
            &mut self
                .metrics_events
                .lock()
                .expect("dispatcher mutex poisoned"),
        )
    }
}

#[async_trait]
impl Dispatcher for MemoryDispatcher {
    async fn to_deciders(&self, request: DecisionRequest) -> EngineResult<()> {
        self.decisions
            .lock()
            .expect("dispatcher mutex poisoned")
            .push(request);
        Ok(())
    }

    async fn to_task_executors(&self, request: TaskAttemptRequest) -> EngineResult<()> {
        self.executor_requests
            .lock()
            .expect("dispatcher mutex poisoned")
            .push(request);
        Ok(())
    }

    async fn to_workflow_engine(
        &self,
        message: WorkflowEngineMessage,
        delay: Duration,
    ) -> EngineResult<()> {
        self.workflow_messages
            .lock()
            .expect("dispatcher mutex poisoned")
            .push((message, delay));
        Ok(())
    }

    async fn to_task_engine(
        &self,
        message: TaskEngineMessage,
        delay: Duration,
    ) -> EngineResult<()> {
        self.task_messages
            .lock()
            .expect("dispatcher mutex poisoned")
            .push((message, delay));
        Ok(())
    }

    async fn to_monitoring(&self, message: MonitoringMessage) -> EngineResult<()> {
        self.monitoring_messages
            .lock()
            .expect("dispatcher mutex poisoned")
            .push(message);
        Ok(())
    }

    async fn to_client(&self, notification: ClientNotification) -> EngineResult<()> {
        self.client_notifications
            .lock()
            .expect("dispatcher mutex poisoned")
            .push(notification);
        Ok(())
    }

    async fn to_metrics(&self, event: MetricsEvent) -> EngineResult<()> {
        self.metrics_events
            .lock()
            .expect("dispatcher mutex poisoned")
            .push(event);
        Ok(())
    }
}
