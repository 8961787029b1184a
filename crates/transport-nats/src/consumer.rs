//! JetStream implementation of the consumer contract.

use std::marker::PhantomData;

use async_nats::jetstream::{self, consumer::pull::Config as ConsumerConfig, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;

use capstan_engine::consumer::MessageConsumer;
use capstan_engine::error::{EngineError, EngineResult};

/// Pull consumer bound to one stream/filter pair.
///
/// One durable consumer per engine queue; the runtime instantiates two per
/// engine type (existing-entity and new-entity filters).
pub struct NatsConsumer<M> {
    js: Context,
    stream: String,
    consumer: String,
    filter_subject: String,
    _message: PhantomData<fn() -> M>,
}

impl<M> NatsConsumer<M> {
    pub async fn new(
        client: std::sync::Arc<async_nats::Client>,
        stream: &str,
        consumer: &str,
        filter_subject: &str,
    ) -> EngineResult<Self> {
        let js = jetstream::new((*client).clone());
        Ok(Self {
            js,
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            filter_subject: filter_subject.to_string(),
            _message: PhantomData,
        })
    }

    /// Create or get the durable consumer.
    async fn ensure_consumer(
        &self,
    ) -> EngineResult<jetstream::consumer::Consumer<ConsumerConfig>> {
        let stream = self
            .js
            .get_stream(&self.stream)
            .await
            .map_err(|e| EngineError::Dispatch(e.to_string()))?;

        let config = ConsumerConfig {
            durable_name: Some(self.consumer.clone()),
            filter_subject: self.filter_subject.clone(),
            ..Default::default()
        };

        match stream.get_consumer(&self.consumer).await {
            Ok(consumer) => Ok(consumer),
            Err(_) => {
                let consumer = stream
                    .create_consumer(config)
                    .await
                    .map_err(|e| EngineError::Dispatch(e.to_string()))?;
                tracing::info!(consumer = %self.consumer, "created NATS consumer");
                Ok(consumer)
            }
        }
    }
}

#[async_trait]
impl<M> MessageConsumer<M> for NatsConsumer<M>
where
    M: DeserializeOwned + Send + Sync,
{
    type Token = jetstream::Message;

    async fn receive(&self) -> EngineResult<Option<(M, Self::Token)>> {
        let consumer = self.ensure_consumer().await?;

        let mut messages = consumer
            .fetch()
            .max_messages(1)
            .messages()
            .await
            .map_err(|e| EngineError::Dispatch(e.to_string()))?;

        if let Some(msg) = messages.next().await {
            let msg = msg.map_err(|e| EngineError::Dispatch(e.to_string()))?;
            let message: M = serde_json::from_slice(&msg.payload)?;
            return Ok(Some((message, msg)));
        }

        Ok(None)
    }

    async fn ack(&self, token: Self::Token) -> EngineResult<()> {
        token
            .ack()
            .await
            .map_err(|e| EngineError::Dispatch(e.to_string()))
    }

    async fn nack(&self, token: Self::Token) -> EngineResult<()> {
        token
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| EngineError::Dispatch(e.to_string()))
    }
}
