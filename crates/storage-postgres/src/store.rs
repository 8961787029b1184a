//! Compare-on-write state store over Postgres.
//!
//! One row per entity, state serialized as JSONB. The old-value fence is the
//! `WHERE state = $expected` clause: JSONB comparison is structural, so a
//! concurrent writer is detected by an unaffected UPDATE, reported as
//! [`PutOutcome::Conflict`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use capstan_engine::error::{EngineError, EngineResult};
use capstan_engine::ids::{JobName, TaskId, WorkflowId};
use capstan_engine::monitoring::MonitoringPerNameState;
use capstan_engine::storage::{
    MonitoringStateStorage, PutOutcome, TaskStateStorage, WorkflowStateStorage,
};
use capstan_engine::task::TaskState;
use capstan_engine::workflow::WorkflowEngineState;

use crate::pool::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS capstan_workflow_states (
    workflow_id TEXT PRIMARY KEY,
    state JSONB NOT NULL
);
CREATE TABLE IF NOT EXISTS capstan_task_states (
    task_id TEXT PRIMARY KEY,
    state JSONB NOT NULL
);
CREATE TABLE IF NOT EXISTS capstan_monitoring_states (
    job_name TEXT PRIMARY KEY,
    state JSONB NOT NULL
);
"#;

/// Postgres-backed storage for all three engine state kinds.
#[derive(Clone)]
pub struct PostgresStateStorage {
    pool: DbPool,
}

impl PostgresStateStorage {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create the state tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> EngineResult<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        tracing::info!("state tables ready");
        Ok(())
    }

    async fn get_row<T: DeserializeOwned>(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
    ) -> EngineResult<Option<T>> {
        let query = format!("SELECT state FROM {table} WHERE {key_column} = $1");
        let row: Option<(serde_json::Value,)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|(value,)| serde_json::from_value(value))
            .transpose()
            .map_err(EngineError::from)
    }

    async fn put_row<T: Serialize>(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
        new: &T,
        expected_old: Option<&T>,
    ) -> EngineResult<PutOutcome> {
        let new_value = serde_json::to_value(new)?;

        let affected = match expected_old {
            None => {
                let query = format!(
                    "INSERT INTO {table} ({key_column}, state) VALUES ($1, $2) \
                     ON CONFLICT ({key_column}) DO NOTHING"
                );
                sqlx::query(&query)
                    .bind(key)
                    .bind(&new_value)
                    .execute(&self.pool)
                    .await
                    .map_err(storage_err)?
                    .rows_affected()
            }
            Some(expected) => {
                let expected_value = serde_json::to_value(expected)?;
                let query = format!(
                    "UPDATE {table} SET state = $2 WHERE {key_column} = $1 AND state = $3"
                );
                sqlx::query(&query)
                    .bind(key)
                    .bind(&new_value)
                    .bind(&expected_value)
                    .execute(&self.pool)
                    .await
                    .map_err(storage_err)?
                    .rows_affected()
            }
        };

        Ok(if affected == 1 {
            PutOutcome::Applied
        } else {
            PutOutcome::Conflict
        })
    }

    async fn delete_row(&self, table: &str, key_column: &str, key: &str) -> EngineResult<()> {
        let query = format!("DELETE FROM {table} WHERE {key_column} = $1");
        sqlx::query(&query)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

fn storage_err(e: sqlx::Error) -> EngineError {
    EngineError::Storage(e.to_string())
}

#[async_trait]
impl WorkflowStateStorage for PostgresStateStorage {
    async fn get(&self, workflow_id: &WorkflowId) -> EngineResult<Option<WorkflowEngineState>> {
        self.get_row("capstan_workflow_states", "workflow_id", workflow_id.as_str())
            .await
    }

    async fn put(
        &self,
        workflow_id: &WorkflowId,
        new: &WorkflowEngineState,
        expected_old: Option<&WorkflowEngineState>,
    ) -> EngineResult<PutOutcome> {
        self.put_row(
            "capstan_workflow_states",
            "workflow_id",
            workflow_id.as_str(),
            new,
            expected_old,
        )
        .await
    }

    async fn delete(&self, workflow_id: &WorkflowId) -> EngineResult<()> {
        self.delete_row("capstan_workflow_states", "workflow_id", workflow_id.as_str())
            .await
    }
}

#[async_trait]
impl TaskStateStorage for PostgresStateStorage {
    async fn get(&self, task_id: &TaskId) -> EngineResult<Option<TaskState>> {
        self.get_row("capstan_task_states", "task_id", task_id.as_str())
            .await
    }

    async fn put(
        &self,
        task_id: &TaskId,
        new: &TaskState,
        expected_old: Option<&TaskState>,
    ) -> EngineResult<PutOutcome> {
        self.put_row(
            "capstan_task_states",
            "task_id",
            task_id.as_str(),
            new,
            expected_old,
        )
        .await
    }

    async fn delete(&self, task_id: &TaskId) -> EngineResult<()> {
        self.delete_row("capstan_task_states", "task_id", task_id.as_str())
            .await
    }
}

#[async_trait]
impl MonitoringStateStorage for PostgresStateStorage {
    async fn get(&self, job_name: &JobName) -> EngineResult<Option<MonitoringPerNameState>> {
        self.get_row("capstan_monitoring_states", "job_name", job_name.as_str())
            .await
    }

    async fn put(
        &self,
        job_name: &JobName,
        new: &MonitoringPerNameState,
        expected_old: Option<&MonitoringPerNameState>,
    ) -> EngineResult<PutOutcome> {
        self.put_row(
            "capstan_monitoring_states",
            "job_name",
            job_name.as_str(),
            new,
            expected_old,
        )
        .await
    }

    async fn delete(&self, job_name: &JobName) -> EngineResult<()> {
        self.delete_row("capstan_monitoring_states", "job_name", job_name.as_str())
            .await
    }
}
