//! Capstan orchestration core.
//!
//! Durable workflow/task orchestration driven by a message bus: per-entity
//! state machines load the addressed entity, apply one message, persist the
//! result behind a compare-on-write fence and emit follow-up messages. All
//! broker and store specifics live behind the [`dispatcher`], [`consumer`]
//! and [`storage`] contracts.
//!
//! Guarantees the engines uphold under at-least-once delivery:
//! - at most one decision in flight per workflow, with FIFO buffering and
//!   replay of messages that arrive mid-decision;
//! - idempotent handling of redelivered completions (command-status checks,
//!   first-seen checks, old-value fencing);
//! - state of a finished entity is deleted, never retained;
//! - the property store is garbage-collected by reachability on every
//!   decision boundary.

pub mod consumer;
pub mod data;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod memory;
pub mod messages;
pub mod monitoring;
pub mod storage;
pub mod task;
pub mod workflow;

pub use consumer::MessageConsumer;
pub use dispatcher::Dispatcher;
pub use error::{EngineError, EngineResult};
pub use monitoring::{MonitoringPerNameEngine, MonitoringPerNameState};
pub use storage::{
    Logged, MonitoringStateStorage, PutOutcome, TaskStateStorage, WorkflowStateStorage,
};
pub use task::{TaskEngine, TaskState, TaskStatus};
pub use workflow::{WorkflowEngine, WorkflowEngineState};
