//! Per-process node context.
//!
//! Built once at startup and shared by handle with the gateway, the router
//! and every worker task.

use std::sync::Arc;

use crate::bus::RelayBus;
use crate::directory::PresenceDirectory;
use crate::error::BackendError;
use crate::node::NodeId;
use crate::queue::IngestionQueue;
use crate::router::RouterStats;
use crate::session::SessionTable;

/// Everything one node needs to accept, route and deliver messages.
pub struct NodeContext {
    node_id: NodeId,
    sessions: SessionTable,
    directory: Arc<dyn PresenceDirectory>,
    queue: Arc<dyn IngestionQueue>,
    bus: Arc<dyn RelayBus>,
    stats: RouterStats,
}

impl NodeContext {
    /// Create a context around the shared backends.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        directory: Arc<dyn PresenceDirectory>,
        queue: Arc<dyn IngestionQueue>,
        bus: Arc<dyn RelayBus>,
    ) -> Self {
        Self {
            node_id,
            sessions: SessionTable::new(),
            directory,
            queue,
            bus,
            stats: RouterStats::default(),
        }
    }

    /// This node's identity.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Live connections on this node.
    #[must_use]
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// The shared presence directory.
    #[must_use]
    pub fn directory(&self) -> &dyn PresenceDirectory {
        self.directory.as_ref()
    }

    /// The shared ingestion queue.
    #[must_use]
    pub fn queue(&self) -> &dyn IngestionQueue {
        self.queue.as_ref()
    }

    /// The shared relay bus.
    #[must_use]
    pub fn bus(&self) -> &dyn RelayBus {
        self.bus.as_ref()
    }

    /// Routing counters for this node.
    #[must_use]
    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Whether the presence directory names this node as `user_id`'s owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn is_owned_by_this_node(&self, user_id: &str) -> Result<bool, BackendError> {
        self.directory.is_owned_by(user_id, &self.node_id).await
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
