//! Per-name monitoring aggregator.
//!
//! Maintains one row of status-bucket counters per job name, derived from
//! task/workflow status transitions, and reports a `JobCreated` event to the
//! metrics sink exactly once, when a name is first seen.

use serde::{Deserialize, Serialize};

use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, EngineResult};
use crate::ids::JobName;
use crate::messages::{JobStatus, MetricsEvent, MonitoringMessage};
use crate::storage::{MonitoringStateStorage, PutOutcome};
use crate::workflow::engine::MAX_CONFLICT_RETRIES;

/// Counters per status bucket for one job name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringPerNameState {
    pub job_name: JobName,
    pub running_ok_count: i64,
    pub running_warning_count: i64,
    pub running_error_count: i64,
    pub terminated_completed_count: i64,
    pub terminated_canceled_count: i64,
}

impl MonitoringPerNameState {
    pub fn new(job_name: JobName) -> Self {
        Self {
            job_name,
            running_ok_count: 0,
            running_warning_count: 0,
            running_error_count: 0,
            terminated_completed_count: 0,
            terminated_canceled_count: 0,
        }
    }

    fn bucket_mut(&mut self, status: JobStatus) -> &mut i64 {
        match status {
            JobStatus::RunningOk => &mut self.running_ok_count,
            JobStatus::RunningWarning => &mut self.running_warning_count,
            JobStatus::RunningError => &mut self.running_error_count,
            JobStatus::TerminatedCompleted => &mut self.terminated_completed_count,
            JobStatus::TerminatedCanceled => &mut self.terminated_canceled_count,
        }
    }

    /// Move one job between status buckets.
    pub fn apply_transition(&mut self, old_status: Option<JobStatus>, new_status: JobStatus) {
        if let Some(old) = old_status {
            *self.bucket_mut(old) -= 1;
        }
        *self.bucket_mut(new_status) += 1;
    }
}

pub struct MonitoringPerNameEngine<S, D> {
    storage: S,
    dispatcher: D,
}

impl<S: MonitoringStateStorage, D: Dispatcher> MonitoringPerNameEngine<S, D> {
    pub fn new(storage: S, dispatcher: D) -> Self {
        Self { storage, dispatcher }
    }

    pub async fn handle(&self, message: &MonitoringMessage) -> EngineResult<()> {
        let mut attempt = 0;
        loop {
            match self.handle_once(message).await {
                Err(err) if err.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        job_name = %message.job_name(),
                        attempt,
                        "storage conflict, reapplying"
                    );
                }
                Err(err) if err.is_conflict() => {
                    tracing::error!(
                        job_name = %message.job_name(),
                        "storage conflict persisted after {MAX_CONFLICT_RETRIES} retries"
                    );
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    async fn handle_once(&self, message: &MonitoringMessage) -> EngineResult<()> {
        let job_name = message.job_name();
        let old = self.storage.get(job_name).await?;
        let first_seen = old.is_none();
        let mut new = old
            .clone()
            .unwrap_or_else(|| MonitoringPerNameState::new(job_name.clone()));

        match message {
            MonitoringMessage::JobStatusUpdated {
                old_status,
                new_status,
                ..
            } => {
                // A first-seen row has no prior count to decrement; honoring
                // the old status would push the bucket negative.
                let old_status = if first_seen { None } else { *old_status };
                new.apply_transition(old_status, *new_status);
            }
        }

        if Some(&new) != old.as_ref() {
            match self.storage.put(job_name, &new, old.as_ref()).await? {
                PutOutcome::Applied => {}
                PutOutcome::Conflict => {
                    return Err(EngineError::Conflict {
                        key: job_name.to_string(),
                    })
                }
            }
        }

        // The first-seen decision is gated by the same compare against the
        // prior stored state, so redelivery cannot emit twice.
        if first_seen {
            tracing::info!(job_name = %job_name, "new job name seen");
            self.dispatcher
                .to_metrics(MetricsEvent::JobCreated {
                    job_name: job_name.clone(),
                })
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDispatcher, MemoryStorage};
    use std::sync::Arc;

    fn engine() -> (
        MonitoringPerNameEngine<Arc<MemoryStorage>, Arc<MemoryDispatcher>>,
        Arc<MemoryStorage>,
        Arc<MemoryDispatcher>,
    ) {
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());
        (
            MonitoringPerNameEngine::new(storage.clone(), dispatcher.clone()),
            storage,
            dispatcher,
        )
    }

    fn update(old: Option<JobStatus>, new: JobStatus) -> MonitoringMessage {
        MonitoringMessage::JobStatusUpdated {
            job_name: JobName::from("billing"),
            old_status: old,
            new_status: new,
        }
    }

    #[tokio::test]
    async fn test_first_seen_emits_job_created_once() {
        let (engine, _storage, dispatcher) = engine();

        engine
            .handle(&update(None, JobStatus::RunningOk))
            .await
            .unwrap();
        assert_eq!(dispatcher.take_metrics_events().len(), 1);

        engine
            .handle(&update(Some(JobStatus::RunningOk), JobStatus::TerminatedCompleted))
            .await
            .unwrap();
        assert!(dispatcher.take_metrics_events().is_empty());
    }

    #[tokio::test]
    async fn test_transition_moves_between_buckets() {
        let (engine, storage, _dispatcher) = engine();
        let name = JobName::from("billing");

        engine
            .handle(&update(None, JobStatus::RunningOk))
            .await
            .unwrap();
        engine
            .handle(&update(Some(JobStatus::RunningOk), JobStatus::TerminatedCompleted))
            .await
            .unwrap();

        let state = MonitoringStateStorage::get(storage.as_ref(), &name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.running_ok_count, 0);
        assert_eq!(state.terminated_completed_count, 1);
    }

    #[tokio::test]
    async fn test_first_seen_update_with_old_status_nets_to_zero() {
        // A first-seen update that already carries an old status must not
        // push the old bucket negative.
        let (engine, storage, dispatcher) = engine();
        let name = JobName::from("billing");

        engine
            .handle(&update(Some(JobStatus::RunningOk), JobStatus::TerminatedCompleted))
            .await
            .unwrap();

        let state = MonitoringStateStorage::get(storage.as_ref(), &name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.running_ok_count, 0);
        assert_eq!(state.terminated_completed_count, 1);
        assert_eq!(dispatcher.take_metrics_events().len(), 1);
    }
}
