//! Inbound message contract polled by the runtime workers.
//!
//! Acknowledgment is explicit and happens only after the resulting state
//! mutation is durably persisted; unacked messages are redelivered by the
//! broker after a bounded timeout (the at-least-once source every handler
//! defends against).

use async_trait::async_trait;

use crate::error::EngineResult;

#[async_trait]
pub trait MessageConsumer<M>: Send + Sync {
    /// Broker-specific redelivery token.
    type Token: Send;

    /// Next message, or `None` when the queue is currently empty.
    async fn receive(&self) -> EngineResult<Option<(M, Self::Token)>>;

    /// Acknowledge successful processing.
    async fn ack(&self, token: Self::Token) -> EngineResult<()>;

    /// Give the message back for redelivery.
    async fn nack(&self, token: Self::Token) -> EngineResult<()>;
}
