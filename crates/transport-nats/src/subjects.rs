//! Subject and stream layout.
//!
//! Each engine type owns one stream. Engine traffic is split into a
//! `new`-entity subject (creation requests) and an `existing`-entity subject
//! (events for already-created entities), consumed preferentially in that
//! order. The entity id is the last subject token, so all messages for one
//! entity share a subject and delivery stays ordered per entity.

/// Stream name / wildcard subject pairs.
pub const WORKFLOW_STREAM: &str = "capstan_workflow";
pub const WORKFLOW_SUBJECTS: &str = "capstan.workflow.>";
pub const TASK_STREAM: &str = "capstan_task";
pub const TASK_SUBJECTS: &str = "capstan.task.>";
pub const MONITORING_STREAM: &str = "capstan_monitoring";
pub const MONITORING_SUBJECTS: &str = "capstan.monitoring.>";
pub const DECIDER_STREAM: &str = "capstan_deciders";
pub const DECIDER_SUBJECT: &str = "capstan.deciders";
pub const EXECUTOR_STREAM: &str = "capstan_executors";
pub const EXECUTOR_SUBJECT: &str = "capstan.executors";
pub const CLIENT_STREAM: &str = "capstan_client";
pub const CLIENT_SUBJECT: &str = "capstan.client";
pub const METRICS_STREAM: &str = "capstan_metrics";
pub const METRICS_SUBJECT: &str = "capstan.metrics";

/// Consumer filter for existing-entity workflow traffic.
pub const WORKFLOW_EXISTING_FILTER: &str = "capstan.workflow.existing.>";
pub const WORKFLOW_NEW_FILTER: &str = "capstan.workflow.new.>";
pub const TASK_EXISTING_FILTER: &str = "capstan.task.existing.>";
pub const TASK_NEW_FILTER: &str = "capstan.task.new.>";
pub const MONITORING_FILTER: &str = "capstan.monitoring.>";

pub fn workflow_subject(new_entity: bool, workflow_id: &str) -> String {
    if new_entity {
        format!("capstan.workflow.new.{workflow_id}")
    } else {
        format!("capstan.workflow.existing.{workflow_id}")
    }
}

pub fn task_subject(new_entity: bool, task_id: &str) -> String {
    if new_entity {
        format!("capstan.task.new.{task_id}")
    } else {
        format!("capstan.task.existing.{task_id}")
    }
}

pub fn monitoring_subject(job_name: &str) -> String {
    format!("capstan.monitoring.{job_name}")
}
