//! Message router.
//!
//! The router drains the ingestion queue and the relay bus. For an envelope
//! pulled from the queue it asks the presence directory whether this node
//! owns the recipient: if so it delivers locally, otherwise it republishes
//! the envelope on the relay bus unchanged. For an envelope arriving on the
//! relay bus it repeats the ownership check and delivers only if it is the
//! owner; every other node discards it.
//!
//! Which node's consumer wins an envelope therefore has no effect on where
//! it ends up. Nothing here retries: a failed delivery or a directory miss
//! drops the message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_protocol::Envelope;
use tracing::{debug, error, info, trace, warn};

use crate::bus::BusSubscription;
use crate::context::NodeContext;
use crate::gateway::ConnectionGateway;
use crate::queue::QueueConsumer;

/// Pause after a backend read error before trying again.
const BACKEND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Why an envelope was not delivered or relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The envelope names no recipient.
    NoReceiver,
    /// This node owns the recipient but the local session is gone or closed.
    StaleSession,
    /// Relay copy for a recipient this node does not own.
    NotOwner,
    /// The directory or relay bus could not be reached.
    Backend,
}

/// What happened to one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Written to a connection on this node.
    Delivered,
    /// Republished on the relay bus.
    Relayed,
    /// Discarded.
    Dropped(DropReason),
}

/// Routing counters for one node.
#[derive(Debug, Default)]
pub struct RouterStats {
    delivered: AtomicU64,
    relayed: AtomicU64,
    relay_delivered: AtomicU64,
    relay_ignored: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
}

impl RouterStats {
    fn record_queue(&self, outcome: RouteOutcome) {
        match outcome {
            RouteOutcome::Delivered => self.delivered.fetch_add(1, Ordering::Relaxed),
            RouteOutcome::Relayed => self.relayed.fetch_add(1, Ordering::Relaxed),
            RouteOutcome::Dropped(_) => self.dropped.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_relay(&self, outcome: RouteOutcome) {
        match outcome {
            RouteOutcome::Delivered => self.relay_delivered.fetch_add(1, Ordering::Relaxed),
            RouteOutcome::Dropped(DropReason::NotOwner) => {
                self.relay_ignored.fetch_add(1, Ordering::Relaxed)
            }
            _ => self.dropped.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            relay_delivered: self.relay_delivered.load(Ordering::Relaxed),
            relay_ignored: self.relay_ignored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RouterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Queue envelopes delivered on this node.
    pub delivered: u64,
    /// Queue envelopes republished on the relay bus.
    pub relayed: u64,
    /// Relay envelopes delivered on this node.
    pub relay_delivered: u64,
    /// Relay envelopes for users owned elsewhere.
    pub relay_ignored: u64,
    /// Envelopes dropped for any other reason.
    pub dropped: u64,
    /// Client payloads rejected before queueing.
    pub malformed: u64,
}

/// Dispatch loop for one node.
#[derive(Debug, Clone)]
pub struct Router {
    ctx: Arc<NodeContext>,
    gateway: ConnectionGateway,
}

impl Router {
    /// Create a router that delivers through `gateway`.
    #[must_use]
    pub fn new(gateway: ConnectionGateway) -> Self {
        Self {
            ctx: Arc::clone(gateway.context()),
            gateway,
        }
    }

    /// Route an envelope pulled from the ingestion queue.
    pub async fn route(&self, envelope: Envelope) -> RouteOutcome {
        let outcome = self.route_inner(&envelope).await;
        self.ctx.stats().record_queue(outcome);
        outcome
    }

    async fn route_inner(&self, envelope: &Envelope) -> RouteOutcome {
        let Some(receiver) = envelope.receiver() else {
            debug!(node = %self.ctx.node_id(), "Dropping envelope without receiver");
            return RouteOutcome::Dropped(DropReason::NoReceiver);
        };

        match self.ctx.is_owned_by_this_node(receiver).await {
            Ok(true) => self.deliver(receiver, envelope).await,
            Ok(false) => match self.ctx.bus().publish(envelope).await {
                Ok(()) => {
                    trace!(receiver = %receiver, "Relayed envelope");
                    RouteOutcome::Relayed
                }
                Err(e) => {
                    warn!(receiver = %receiver, error = %e, "Relay publish failed, dropping");
                    RouteOutcome::Dropped(DropReason::Backend)
                }
            },
            Err(e) => {
                warn!(receiver = %receiver, error = %e, "Presence lookup failed, dropping");
                RouteOutcome::Dropped(DropReason::Backend)
            }
        }
    }

    /// Handle an envelope received from the relay bus.
    pub async fn on_relayed(&self, envelope: Envelope) -> RouteOutcome {
        let outcome = self.on_relayed_inner(&envelope).await;
        self.ctx.stats().record_relay(outcome);
        outcome
    }

    async fn on_relayed_inner(&self, envelope: &Envelope) -> RouteOutcome {
        let Some(receiver) = envelope.receiver() else {
            return RouteOutcome::Dropped(DropReason::NoReceiver);
        };

        match self.ctx.is_owned_by_this_node(receiver).await {
            Ok(true) => self.deliver(receiver, envelope).await,
            Ok(false) => RouteOutcome::Dropped(DropReason::NotOwner),
            Err(e) => {
                warn!(receiver = %receiver, error = %e, "Presence lookup failed, dropping relay");
                RouteOutcome::Dropped(DropReason::Backend)
            }
        }
    }

    async fn deliver(&self, receiver: &str, envelope: &Envelope) -> RouteOutcome {
        if self.gateway.deliver_local(receiver, envelope).await {
            debug!(receiver = %receiver, node = %self.ctx.node_id(), "Delivered");
            RouteOutcome::Delivered
        } else {
            debug!(receiver = %receiver, node = %self.ctx.node_id(), "Owned here but session is stale, dropping");
            RouteOutcome::Dropped(DropReason::StaleSession)
        }
    }

    /// Drain an ingestion consumer until it closes.
    ///
    /// Envelopes are processed one at a time. Read errors are logged and
    /// the loop keeps going after a short pause.
    pub async fn run_consumer(&self, mut consumer: Box<dyn QueueConsumer>) {
        info!(node = %self.ctx.node_id(), "Ingestion consumer started");
        loop {
            match consumer.next().await {
                Ok(Some(envelope)) => {
                    self.route(envelope).await;
                }
                Ok(None) => break,
                Err(e) => {
                    error!(node = %self.ctx.node_id(), error = %e, "Ingestion consumer error");
                    tokio::time::sleep(BACKEND_RETRY_DELAY).await;
                }
            }
        }
        info!(node = %self.ctx.node_id(), "Ingestion consumer stopped");
    }

    /// Drain the relay subscription until it closes.
    pub async fn run_relay(&self, mut subscription: Box<dyn BusSubscription>) {
        info!(node = %self.ctx.node_id(), "Relay listener started");
        loop {
            match subscription.next().await {
                Ok(Some(envelope)) => {
                    self.on_relayed(envelope).await;
                }
                Ok(None) => break,
                Err(e) => {
                    error!(node = %self.ctx.node_id(), error = %e, "Relay subscription error");
                    tokio::time::sleep(BACKEND_RETRY_DELAY).await;
                }
            }
        }
        info!(node = %self.ctx.node_id(), "Relay listener stopped");
    }
}
