//! NATS JetStream transport for the Capstan engines.
//!
//! Implements the engine-facing dispatcher and consumer contracts on top of
//! JetStream streams, one per engine type, with `new`/`existing` subject
//! splits and entity-id subject keying.

pub mod consumer;
pub mod dispatcher;
pub mod subjects;

pub use consumer::NatsConsumer;
pub use dispatcher::NatsDispatcher;

use capstan_engine::error::{EngineError, EngineResult};

/// Connect to the NATS server.
pub async fn connect(nats_url: &str) -> EngineResult<std::sync::Arc<async_nats::Client>> {
    let client = async_nats::connect(nats_url)
        .await
        .map_err(|e| EngineError::Dispatch(e.to_string()))?;
    tracing::info!(nats_url = %nats_url, "connected to NATS");
    Ok(std::sync::Arc::new(client))
}
