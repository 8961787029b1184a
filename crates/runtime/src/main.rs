//! Capstan worker binary.
//!
//! Runs the workflow, task and monitoring engine pools against NATS and
//! Postgres.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capstan_engine::messages::{MonitoringMessage, TaskEngineMessage, WorkflowEngineMessage};
use capstan_engine::monitoring::MonitoringPerNameEngine;
use capstan_engine::storage::Logged;
use capstan_engine::task::TaskEngine;
use capstan_engine::workflow::WorkflowEngine;
use capstan_runtime::{spawn_workers, NoTraffic, RuntimeConfig};
use capstan_storage_postgres::{create_pool, PostgresStateStorage};
use capstan_transport_nats::{subjects, NatsConsumer, NatsDispatcher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,capstan_runtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    tracing::info!("starting capstan worker");

    let config = RuntimeConfig::from_env()?;
    tracing::info!(
        nats_url = %config.nats_url,
        workflow_workers = config.workflow_concurrency,
        task_workers = config.task_concurrency,
        "runtime configuration loaded"
    );

    let client = capstan_transport_nats::connect(&config.nats_url).await?;
    let dispatcher = Arc::new(NatsDispatcher::new(client.clone()).await?);

    let pool = create_pool(&config.database_url, 10).await?;
    let storage = Arc::new(PostgresStateStorage::new(pool));
    storage.ensure_schema().await?;

    let workflow_engine = Arc::new(WorkflowEngine::new(
        Logged(storage.clone()),
        dispatcher.clone(),
    ));
    let task_engine = Arc::new(TaskEngine::new(Logged(storage.clone()), dispatcher.clone()));
    let monitoring_engine = Arc::new(MonitoringPerNameEngine::new(
        Logged(storage.clone()),
        dispatcher.clone(),
    ));

    let workflow_existing: Arc<NatsConsumer<WorkflowEngineMessage>> = Arc::new(
        NatsConsumer::new(
            client.clone(),
            subjects::WORKFLOW_STREAM,
            "workflow-engine-existing",
            subjects::WORKFLOW_EXISTING_FILTER,
        )
        .await?,
    );
    let workflow_new: Arc<NatsConsumer<WorkflowEngineMessage>> = Arc::new(
        NatsConsumer::new(
            client.clone(),
            subjects::WORKFLOW_STREAM,
            "workflow-engine-new",
            subjects::WORKFLOW_NEW_FILTER,
        )
        .await?,
    );
    let task_existing: Arc<NatsConsumer<TaskEngineMessage>> = Arc::new(
        NatsConsumer::new(
            client.clone(),
            subjects::TASK_STREAM,
            "task-engine-existing",
            subjects::TASK_EXISTING_FILTER,
        )
        .await?,
    );
    let task_new: Arc<NatsConsumer<TaskEngineMessage>> = Arc::new(
        NatsConsumer::new(
            client.clone(),
            subjects::TASK_STREAM,
            "task-engine-new",
            subjects::TASK_NEW_FILTER,
        )
        .await?,
    );
    let monitoring_consumer: Arc<NatsConsumer<MonitoringMessage>> = Arc::new(
        NatsConsumer::new(
            client.clone(),
            subjects::MONITORING_STREAM,
            "monitoring-engine",
            subjects::MONITORING_FILTER,
        )
        .await?,
    );

    let mut handles = Vec::new();
    handles.extend(spawn_workers(
        "workflow-engine",
        config.workflow_concurrency,
        workflow_engine,
        workflow_existing,
        workflow_new,
        config.poll_interval,
    ));
    handles.extend(spawn_workers(
        "task-engine",
        config.task_concurrency,
        task_engine,
        task_existing,
        task_new,
        config.poll_interval,
    ));
    handles.extend(spawn_workers(
        "monitoring-engine",
        config.monitoring_concurrency,
        monitoring_engine,
        monitoring_consumer,
        Arc::new(NoTraffic),
        config.poll_interval,
    ));

    tracing::info!(workers = handles.len(), "worker pools running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    for handle in &handles {
        handle.abort();
    }

    tracing::info!("capstan worker stopped");
    Ok(())
}
