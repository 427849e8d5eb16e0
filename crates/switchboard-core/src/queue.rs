//! Ingestion queue.
//!
//! Every envelope a gateway receives goes into one logical queue shared by
//! the whole cluster. Each envelope is handed to exactly one consumer, on
//! whichever node pulls it first. Consumers do not acknowledge work, so an
//! envelope taken by a consumer that then dies is gone.

use async_trait::async_trait;
use std::sync::Arc;
use switchboard_protocol::Envelope;
use tokio::sync::{mpsc, Mutex};

use crate::error::BackendError;

/// Durable, competing-consumers buffer between receipt and routing.
#[async_trait]
pub trait IngestionQueue: Send + Sync {
    /// Append an envelope to the queue.
    async fn publish(&self, envelope: &Envelope) -> Result<(), BackendError>;

    /// Open a new consumer. Consumers on every node compete for the same
    /// envelopes.
    async fn consumer(&self) -> Result<Box<dyn QueueConsumer>, BackendError>;
}

/// One competing consumer.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait for the next envelope.
    ///
    /// Returns `Ok(None)` once the queue is shut down.
    async fn next(&mut self) -> Result<Option<Envelope>, BackendError>;
}

/// In-process queue for tests and single-node deployments.
///
/// All consumers share one receiver, so each envelope goes to exactly one of
/// them. Clone the queue (or share an `Arc`) across node contexts to model a
/// cluster.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

impl MemoryQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Take the next envelope if one is already waiting.
    pub async fn try_next(&self) -> Option<Envelope> {
        self.receiver.lock().await.try_recv().ok()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestionQueue for MemoryQueue {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BackendError> {
        self.sender
            .send(envelope.clone())
            .map_err(|_| BackendError::Closed)
    }

    async fn consumer(&self) -> Result<Box<dyn QueueConsumer>, BackendError> {
        Ok(Box::new(MemoryQueueConsumer {
            receiver: Arc::clone(&self.receiver),
        }))
    }
}

struct MemoryQueueConsumer {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

#[async_trait]
impl QueueConsumer for MemoryQueueConsumer {
    async fn next(&mut self) -> Result<Option<Envelope>, BackendError> {
        Ok(self.receiver.lock().await.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_then_consume() {
        let queue = MemoryQueue::new();
        let mut consumer = queue.consumer().await.unwrap();

        queue.publish(&Envelope::text("bob", "hi")).await.unwrap();

        let envelope = consumer.next().await.unwrap().unwrap();
        assert_eq!(envelope.receiver(), Some("bob"));
    }

    #[tokio::test]
    async fn test_each_envelope_goes_to_one_consumer() {
        let queue = MemoryQueue::new();
        let mut a = queue.consumer().await.unwrap();
        let mut b = queue.consumer().await.unwrap();

        queue.publish(&Envelope::text("bob", "one")).await.unwrap();
        queue.publish(&Envelope::text("bob", "two")).await.unwrap();

        let first = a.next().await.unwrap().unwrap();
        let second = b.next().await.unwrap().unwrap();
        assert_eq!(first.content.as_deref(), Some("one"));
        assert_eq!(second.content.as_deref(), Some("two"));

        // Nothing left for anyone.
        let idle = tokio::time::timeout(Duration::from_millis(20), a.next()).await;
        assert!(idle.is_err());
    }
}
