//! Relay bus.
//!
//! A broadcast channel every node subscribes to. The router republishes an
//! envelope here when the recipient is not connected to the consuming node;
//! every node, the publisher included, then checks the presence directory
//! and only the owner delivers.

use async_trait::async_trait;
use std::sync::Arc;
use switchboard_protocol::Envelope;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::BackendError;

/// Default broadcast capacity of the in-memory bus.
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Cluster-wide broadcast channel.
#[async_trait]
pub trait RelayBus: Send + Sync {
    /// Broadcast an envelope to every subscribed node.
    ///
    /// Publishing with no subscribers is not an error.
    async fn publish(&self, envelope: &Envelope) -> Result<(), BackendError>;

    /// Subscribe this node to the bus.
    async fn subscribe(&self) -> Result<Box<dyn BusSubscription>, BackendError>;
}

/// A node's subscription to the relay bus.
#[async_trait]
pub trait BusSubscription: Send {
    /// Wait for the next broadcast envelope.
    ///
    /// Returns `Ok(None)` once the bus is shut down.
    async fn next(&mut self) -> Result<Option<Envelope>, BackendError>;
}

/// In-process bus built on a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<Arc<Envelope>>,
}

impl MemoryBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus with a specific capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayBus for MemoryBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BackendError> {
        // send() only fails when nobody is subscribed.
        let _ = self.sender.send(Arc::new(envelope.clone()));
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn BusSubscription>, BackendError> {
        Ok(Box::new(MemoryBusSubscription {
            receiver: self.sender.subscribe(),
        }))
    }
}

struct MemoryBusSubscription {
    receiver: broadcast::Receiver<Arc<Envelope>>,
}

#[async_trait]
impl BusSubscription for MemoryBusSubscription {
    async fn next(&mut self) -> Result<Option<Envelope>, BackendError> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Ok(Some(envelope.as_ref().clone())),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Relay subscription lagged, envelopes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}
