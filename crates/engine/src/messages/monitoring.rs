//! Messages addressed to the monitoring-per-name aggregator.

use serde::{Deserialize, Serialize};

use crate::ids::JobName;

/// Status bucket of a job (task or workflow) for monitoring purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    RunningOk,
    RunningWarning,
    RunningError,
    TerminatedCompleted,
    TerminatedCanceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitoringMessage {
    /// A job moved from one status bucket to another.
    JobStatusUpdated {
        job_name: JobName,
        /// Absent for the first transition of a freshly-dispatched job.
        #[serde(skip_serializing_if = "Option::is_none")]
        old_status: Option<JobStatus>,
        new_status: JobStatus,
    },
}

impl MonitoringMessage {
    pub fn job_name(&self) -> &JobName {
        match self {
            Self::JobStatusUpdated { job_name, .. } => job_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_value(JobStatus::TerminatedCompleted).unwrap();
        assert_eq!(json, "terminated_completed");
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = MonitoringMessage::JobStatusUpdated {
            job_name: JobName::from("billing"),
            old_status: Some(JobStatus::RunningOk),
            new_status: JobStatus::TerminatedCompleted,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: MonitoringMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
