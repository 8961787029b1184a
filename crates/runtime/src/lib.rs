//! Capstan worker runtime.
//!
//! Wires the engines to a transport and a state store, and runs a
//! fixed-size worker pool per engine type.

pub mod config;
pub mod queue;
pub mod worker;

pub use config::RuntimeConfig;
pub use queue::{NoTraffic, QueueConsumer};
pub use worker::{poll_once, run_worker, spawn_workers, MessageHandler};
