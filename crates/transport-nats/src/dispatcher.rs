//! JetStream implementation of the dispatcher contract.
//!
//! Publishes keyed by entity id and supports "deliver no earlier than
//! now + delay": a delayed send is re-published by a detached task once the
//! delay elapses, so the engines never run in-process timers themselves.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, Context};
use async_trait::async_trait;
use serde::Serialize;

use capstan_engine::dispatcher::Dispatcher;
use capstan_engine::error::{EngineError, EngineResult};
use capstan_engine::messages::{
    ClientNotification, DecisionRequest, MetricsEvent, MonitoringMessage, TaskAttemptRequest,
    TaskEngineMessage, WorkflowEngineMessage,
};

use crate::subjects;

/// JetStream publisher for all engine-outbound traffic.
#[derive(Clone)]
pub struct NatsDispatcher {
    js: Context,
}

impl NatsDispatcher {
    /// Build from an existing client, creating the streams if needed.
    pub async fn new(client: Arc<async_nats::Client>) -> EngineResult<Self> {
        let js = jetstream::new((*client).clone());

        for (stream, subjects) in [
            (subjects::WORKFLOW_STREAM, subjects::WORKFLOW_SUBJECTS),
            (subjects::TASK_STREAM, subjects::TASK_SUBJECTS),
            (subjects::MONITORING_STREAM, subjects::MONITORING_SUBJECTS),
            (subjects::DECIDER_STREAM, subjects::DECIDER_SUBJECT),
            (subjects::EXECUTOR_STREAM, subjects::EXECUTOR_SUBJECT),
            (subjects::CLIENT_STREAM, subjects::CLIENT_SUBJECT),
            (subjects::METRICS_STREAM, subjects::METRICS_SUBJECT),
        ] {
            Self::ensure_stream(&js, stream, subjects).await?;
        }

        Ok(Self { js })
    }

    /// Ensure a JetStream stream exists.
    async fn ensure_stream(js: &Context, stream: &str, subject: &str) -> EngineResult<()> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![subject.to_string()],
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };
                js.create_stream(config)
                    .await
                    .map_err(|e| EngineError::Dispatch(e.to_string()))?;
                tracing::info!(stream = %stream, subject = %subject, "created NATS stream");
                Ok(())
            }
        }
    }

    async fn publish<T: Serialize>(&self, subject: String, payload: &T) -> EngineResult<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.js
            .publish(subject.clone(), bytes.into())
            .await
            .map_err(|e| EngineError::Dispatch(e.to_string()))?
            .await
            .map_err(|e| EngineError::Dispatch(e.to_string()))?;
        tracing::trace!(subject = %subject, "published");
        Ok(())
    }

    /// Publish now, or hand off to a detached task that publishes once the
    /// delay elapses.
    async fn publish_after<T: Serialize>(
        &self,
        subject: String,
        payload: &T,
        delay: Duration,
    ) -> EngineResult<()> {
        if delay.is_zero() {
            return self.publish(subject, payload).await;
        }

        let bytes = serde_json::to_vec(payload)?;
        let js = self.js.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let publish = async {
                js.publish(subject.clone(), bytes.into()).await?.await?;
                Ok::<_, async_nats::Error>(())
            };
            if let Err(e) = publish.await {
                tracing::error!(subject = %subject, error = %e, "delayed publish failed");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for NatsDispatcher {
    async fn to_deciders(&self, request: DecisionRequest) -> EngineResult<()> {
        self.publish(subjects::DECIDER_SUBJECT.to_string(), &request)
            .await
    }

    async fn to_task_executors(&self, request: TaskAttemptRequest) -> EngineResult<()> {
        self.publish(subjects::EXECUTOR_SUBJECT.to_string(), &request)
            .await
    }

    async fn to_workflow_engine(
        &self,
        message: WorkflowEngineMessage,
        delay: Duration,
    ) -> EngineResult<()> {
        let new_entity = matches!(message, WorkflowEngineMessage::DispatchWorkflow { .. });
        let subject = subjects::workflow_subject(new_entity, message.workflow_id().as_str());
        self.publish_after(subject, &message, delay).await
    }

    async fn to_task_engine(
        &self,
        message: TaskEngineMessage,
        delay: Duration,
    ) -> EngineResult<()> {
        let new_entity = matches!(message, TaskEngineMessage::DispatchTask { .. });
        let subject = subjects::task_subject(new_entity, message.task_id().as_str());
        self.publish_after(subject, &message, delay).await
    }

    async fn to_monitoring(&self, message: MonitoringMessage) -> EngineResult<()> {
        let subject = subjects::monitoring_subject(message.job_name().as_str());
        self.publish(subject, &message).await
    }

    async fn to_client(&self, notification: ClientNotification) -> EngineResult<()> {
        self.publish(subjects::CLIENT_SUBJECT.to_string(), &notification)
            .await
    }

    async fn to_metrics(&self, event: MetricsEvent) -> EngineResult<()> {
        self.publish(subjects::METRICS_SUBJECT.to_string(), &event)
            .await
    }
}
