//! In-process queue consumers.
//!
//! `QueueConsumer` backs tests and embedded single-process runs;
//! `NoTraffic` fills the new-entity slot for engine types without a
//! creation queue (monitoring).

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use capstan_engine::consumer::MessageConsumer;
use capstan_engine::error::EngineResult;

/// FIFO queue with redelivery on nack.
pub struct QueueConsumer<M> {
    queue: Mutex<VecDeque<M>>,
}

impl<M> QueueConsumer<M> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, message: M) {
        self.queue
            .lock()
            .expect("queue mutex poisoned")
            .push_back(message);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M> Default for QueueConsumer<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M: Clone + Send + Sync> MessageConsumer<M> for QueueConsumer<M> {
    type Token = M;

    async fn receive(&self) -> EngineResult<Option<(M, Self::Token)>> {
        Ok(self
            .queue
            .lock()
            .expect("queue mutex poisoned")
            .pop_front()
            .map(|message| (message.clone(), message)))
    }

    async fn ack(&self, _token: Self::Token) -> EngineResult<()> {
        Ok(())
    }

    async fn nack(&self, token: Self::Token) -> EngineResult<()> {
        self.queue
            .lock()
            .expect("queue mutex poisoned")
            .push_front(token);
        Ok(())
    }
}

/// A queue that never delivers anything.
pub struct NoTraffic;

#[async_trait]
impl<M: Send + Sync> MessageConsumer<M> for NoTraffic {
    type Token = ();

    async fn receive(&self) -> EngineResult<Option<(M, Self::Token)>> {
        Ok(None)
    }

    async fn ack(&self, _token: Self::Token) -> EngineResult<()> {
        Ok(())
    }

    async fn nack(&self, _token: Self::Token) -> EngineResult<()> {
        Ok(())
    }
}
