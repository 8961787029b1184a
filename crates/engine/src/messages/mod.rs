//! Typed message sets: the wire envelopes of each engine plus the payloads
//! exchanged with deciders, executors, clients and the metrics sink.

pub mod decisions;
pub mod monitoring;
pub mod task;
pub mod workflow;

use serde::{Deserialize, Serialize};

use crate::ids::{JobName, TaskId, WorkflowId};

pub use decisions::{BranchPlan, DecisionPlan, DecisionRequest};
pub use monitoring::{JobStatus, MonitoringMessage};
pub use task::{RetryPolicy, TaskAttemptRequest, TaskEngineMessage};
pub use workflow::WorkflowEngineMessage;

/// Asynchronous notifications for the client that dispatched the work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientNotification {
    WorkflowCompleted {
        workflow_id: WorkflowId,
    },
    WorkflowCanceled {
        workflow_id: WorkflowId,
    },
    TaskCompleted {
        task_id: TaskId,
        output: serde_json::Value,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskCanceled {
        task_id: TaskId,
    },
}

/// Events for the external reporting sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsEvent {
    /// Emitted exactly once, when a job name is seen for the first time.
    JobCreated { job_name: JobName },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_notification_serde() {
        let n = ClientNotification::TaskFailed {
            task_id: TaskId::from("t-1"),
            error: "boom".into(),
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "task_failed");
    }

    #[test]
    fn test_metrics_event_serde() {
        let e = MetricsEvent::JobCreated {
            job_name: JobName::from("billing"),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["job_name"], "billing");
    }
}
