//! Dispatcher contract: outbound sends the engines require.
//!
//! All sends are fire-and-forget; delivery guarantees belong to the broker.
//! A non-zero delay means "deliver no earlier than now + delay" and is the
//! only timer mechanism the engines use (WaitDelay, retry backoff, attempt
//! timeout checks).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::messages::{
    ClientNotification, DecisionRequest, MetricsEvent, MonitoringMessage, TaskAttemptRequest,
    TaskEngineMessage, WorkflowEngineMessage,
};

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn to_deciders(&self, request: DecisionRequest) -> EngineResult<()>;

    async fn to_task_executors(&self, request: TaskAttemptRequest) -> EngineResult<()>;

    async fn to_workflow_engine(
        &self,
        message: WorkflowEngineMessage,
        delay: Duration,
    ) -> EngineResult<()>;

    async fn to_task_engine(
        &self,
        message: TaskEngineMessage,
        delay: Duration,
    ) -> EngineResult<()>;

    async fn to_monitoring(&self, message: MonitoringMessage) -> EngineResult<()>;

    async fn to_client(&self, notification: ClientNotification) -> EngineResult<()>;

    async fn to_metrics(&self, event: MetricsEvent) -> EngineResult<()>;
}

#[async_trait]
impl<D: Dispatcher + ?Sized> Dispatcher for std::sync::Arc<D> {
    async fn to_deciders(&self, request: DecisionRequest) -> EngineResult<()> {
        (**self).to_deciders(request).await
    }

    async fn to_task_executors(&self, request: TaskAttemptRequest) -> EngineResult<()> {
        (**self).to_task_executors(request).await
    }

    async fn to_workflow_engine(
        &self,
        message: WorkflowEngineMessage,
        delay: Duration,
    ) -> EngineResult<()> {
        (**self).to_workflow_engine(message, delay).await
    }

    async fn to_task_engine(
        &self,
        message: TaskEngineMessage,
        delay: Duration,
    ) -> EngineResult<()> {
        (**self).to_task_engine(message, delay).await
    }

    async fn to_monitoring(&self, message: MonitoringMessage) -> EngineResult<()> {
        (**self).to_monitoring(message).await
    }

    async fn to_client(&self, notification: ClientNotification) -> EngineResult<()> {
        (**self).to_client(notification).await
    }

    async fn to_metrics(&self, event: MetricsEvent) -> EngineResult<()> {
        (**self).to_metrics(event).await
    }
}
