//! Engine worker pools.
//!
//! A fixed number of workers per engine type, each pulling one message at a
//! time: existing-entity traffic first so in-flight entities are never
//! starved by a burst of new dispatches. A message is acked only after the
//! engine has durably persisted the resulting transition; recoverable
//! failures are nacked for redelivery, contract violations are acked so
//! they cannot loop forever.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use capstan_engine::consumer::MessageConsumer;
use capstan_engine::dispatcher::Dispatcher;
use capstan_engine::error::EngineResult;
use capstan_engine::messages::{MonitoringMessage, TaskEngineMessage, WorkflowEngineMessage};
use capstan_engine::monitoring::MonitoringPerNameEngine;
use capstan_engine::storage::{MonitoringStateStorage, TaskStateStorage, WorkflowStateStorage};
use capstan_engine::task::TaskEngine;
use capstan_engine::workflow::WorkflowEngine;

/// Uniform handle over the three engines, so one worker loop serves all.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync {
    async fn handle(&self, message: &M) -> EngineResult<()>;
}

#[async_trait]
impl<S, D> MessageHandler<WorkflowEngineMessage> for WorkflowEngine<S, D>
where
    S: WorkflowStateStorage,
    D: Dispatcher,
{
    async fn handle(&self, message: &WorkflowEngineMessage) -> EngineResult<()> {
        WorkflowEngine::handle(self, message).await
    }
}

#[async_trait]
impl<S, D> MessageHandler<TaskEngineMessage> for TaskEngine<S, D>
where
    S: TaskStateStorage,
    D: Dispatcher,
{
    async fn handle(&self, message: &TaskEngineMessage) -> EngineResult<()> {
        TaskEngine::handle(self, message).await
    }
}

#[async_trait]
impl<S, D> MessageHandler<MonitoringMessage> for MonitoringPerNameEngine<S, D>
where
    S: MonitoringStateStorage,
    D: Dispatcher,
{
    async fn handle(&self, message: &MonitoringMessage) -> EngineResult<()> {
        MonitoringPerNameEngine::handle(self, message).await
    }
}

/// Pull and process at most one message; returns whether one was handled.
pub async fn poll_once<M, H, E, N>(
    handler: &H,
    existing: &E,
    new_entities: &N,
) -> EngineResult<bool>
where
    M: Send + Sync,
    H: MessageHandler<M>,
    E: MessageConsumer<M>,
    N: MessageConsumer<M>,
{
    if let Some((message, token)) = existing.receive().await? {
        dispose::<M, E>(existing, handler.handle(&message).await, token).await;
        return Ok(true);
    }

    if let Some((message, token)) = new_entities.receive().await? {
        dispose::<M, N>(new_entities, handler.handle(&message).await, token).await;
        return Ok(true);
    }

    Ok(false)
}

/// Ack or nack based on the handler outcome.
async fn dispose<M, C>(consumer: &C, outcome: EngineResult<()>, token: C::Token)
where
    M: Send + Sync,
    C: MessageConsumer<M>,
{
    let action = match outcome {
        Ok(()) => consumer.ack(token).await,
        Err(err) if err.is_fatal() => {
            // Redelivering a contract violation would loop forever; it needs
            // operator intervention or a code fix.
            tracing::error!(error = %err, "fatal engine error, message dropped");
            consumer.ack(token).await
        }
        Err(err) => {
            tracing::warn!(error = %err, "engine error, message returned for redelivery");
            consumer.nack(token).await
        }
    };
    if let Err(err) = action {
        tracing::error!(error = %err, "failed to settle message with the broker");
    }
}

/// One worker: poll until shutdown.
pub async fn run_worker<M, H, E, N>(
    pool_name: &str,
    index: usize,
    handler: Arc<H>,
    existing: Arc<E>,
    new_entities: Arc<N>,
    poll_interval: Duration,
) where
    M: Send + Sync,
    H: MessageHandler<M>,
    E: MessageConsumer<M>,
    N: MessageConsumer<M>,
{
    tracing::info!(pool = pool_name, index, "worker started");
    loop {
        match poll_once(handler.as_ref(), existing.as_ref(), new_entities.as_ref()).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(poll_interval).await,
            Err(err) => {
                tracing::error!(pool = pool_name, index, error = %err, "receive failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

/// Spawn a fixed-size pool of workers for one engine type.
pub fn spawn_workers<M, H, E, N>(
    pool_name: &'static str,
    concurrency: usize,
    handler: Arc<H>,
    existing: Arc<E>,
    new_entities: Arc<N>,
    poll_interval: Duration,
) -> Vec<tokio::task::JoinHandle<()>>
where
    M: Send + Sync + 'static,
    H: MessageHandler<M> + 'static,
    E: MessageConsumer<M> + 'static,
    N: MessageConsumer<M> + 'static,
{
    (0..concurrency)
        .map(|index| {
            let handler = handler.clone();
            let existing = existing.clone();
            let new_entities = new_entities.clone();
            tokio::spawn(async move {
                run_worker(pool_name, index, handler, existing, new_entities, poll_interval).await;
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{NoTraffic, QueueConsumer};
    use capstan_engine::data::branches::BranchInput;
    use capstan_engine::ids::{WorkflowId, WorkflowName};
    use capstan_engine::memory::{MemoryDispatcher, MemoryStorage};
    use capstan_engine::messages::DecisionPlan;
    use capstan_engine::storage::WorkflowStateStorage as _;

    fn dispatch_message(id: &str) -> WorkflowEngineMessage {
        WorkflowEngineMessage::DispatchWorkflow {
            workflow_id: WorkflowId::from(id),
            workflow_name: WorkflowName::from("order"),
            workflow_input: BranchInput::default(),
            parent_workflow_id: None,
        }
    }

    #[tokio::test]
    async fn test_poll_prefers_existing_traffic() {
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());
        let engine = Arc::new(WorkflowEngine::new(storage.clone(), dispatcher.clone()));

        let existing: Arc<QueueConsumer<WorkflowEngineMessage>> = Arc::new(QueueConsumer::new());
        let new_entities: Arc<QueueConsumer<WorkflowEngineMessage>> =
            Arc::new(QueueConsumer::new());

        new_entities.push(dispatch_message("w-new"));
        existing.push(WorkflowEngineMessage::CancelWorkflow {
            workflow_id: WorkflowId::from("w-ghost"),
        });

        // First poll drains the existing-entity queue.
        assert!(
            poll_once(engine.as_ref(), existing.as_ref(), new_entities.as_ref())
                .await
                .unwrap()
        );
        assert!(existing.is_empty());
        assert_eq!(new_entities.len(), 1);

        // Second poll takes the creation.
        assert!(
            poll_once(engine.as_ref(), existing.as_ref(), new_entities.as_ref())
                .await
                .unwrap()
        );
        assert!(capstan_engine::WorkflowStateStorage::get(
            storage.as_ref(),
            &WorkflowId::from("w-new")
        )
        .await
        .unwrap()
        .is_some());
    }

    #[tokio::test]
    async fn test_end_to_end_dispatch_and_terminate() {
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());
        let engine = Arc::new(WorkflowEngine::new(storage.clone(), dispatcher.clone()));

        let existing: Arc<QueueConsumer<WorkflowEngineMessage>> = Arc::new(QueueConsumer::new());
        let new_entities: Arc<QueueConsumer<WorkflowEngineMessage>> =
            Arc::new(QueueConsumer::new());

        new_entities.push(dispatch_message("w-1"));
        poll_once(engine.as_ref(), existing.as_ref(), new_entities.as_ref())
            .await
            .unwrap();

        // Play the decider: terminate the single branch.
        let request = dispatcher.take_decisions().pop().expect("decision sent");
        existing.push(WorkflowEngineMessage::DecisionCompleted {
            workflow_id: request.workflow_id.clone(),
            decision_id: request.decision_id.clone(),
            plan: DecisionPlan::terminate_all(
                request.branches.iter().map(|b| b.branch_id.clone()),
            ),
        });
        poll_once(engine.as_ref(), existing.as_ref(), new_entities.as_ref())
            .await
            .unwrap();

        assert_eq!(storage.workflow_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_dispatch_is_consumed_not_redelivered() {
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());
        let engine = Arc::new(WorkflowEngine::new(storage.clone(), dispatcher.clone()));

        let existing: Arc<QueueConsumer<WorkflowEngineMessage>> = Arc::new(QueueConsumer::new());
        let new_entities: Arc<QueueConsumer<WorkflowEngineMessage>> =
            Arc::new(QueueConsumer::new());

        new_entities.push(dispatch_message("w-1"));
        poll_once(engine.as_ref(), existing.as_ref(), new_entities.as_ref())
            .await
            .unwrap();
        new_entities.push(dispatch_message("w-1"));
        poll_once(engine.as_ref(), existing.as_ref(), new_entities.as_ref())
            .await
            .unwrap();

        assert!(new_entities.is_empty());
    }

    #[tokio::test]
    async fn test_poll_once_idle_returns_false() {
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());
        let engine = Arc::new(WorkflowEngine::new(storage, dispatcher));

        let existing: Arc<QueueConsumer<WorkflowEngineMessage>> = Arc::new(QueueConsumer::new());

        assert!(
            !poll_once(engine.as_ref(), existing.as_ref(), &NoTraffic)
                .await
                .unwrap()
        );
    }
}
