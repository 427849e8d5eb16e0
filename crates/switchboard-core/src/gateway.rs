//! Connection gateway.
//!
//! Lifecycle calls made by whatever runtime hosts the client connections:
//! [`ConnectionGateway::on_connect`] when a handshake succeeds,
//! [`ConnectionGateway::on_inbound_payload`] for each frame, and
//! [`ConnectionGateway::on_disconnect`] when the connection ends. The router
//! calls [`ConnectionGateway::deliver_local`] for final delivery.
//!
//! The local table write and the directory write on connect are two
//! separate operations with nothing tying them together; a crash or a race
//! can leave them disagreeing.

use std::sync::Arc;
use switchboard_protocol::{codec, Envelope, ProtocolError};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::context::NodeContext;
use crate::error::BackendError;
use crate::session::SessionHandle;

/// Why an inbound payload was not queued.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The client sent something that is not a chat payload.
    #[error("Malformed payload: {0}")]
    Malformed(#[from] ProtocolError),

    /// The ingestion queue rejected the envelope.
    #[error("Ingestion failed: {0}")]
    Queue(#[from] BackendError),
}

/// Node-local connection bookkeeping and delivery.
#[derive(Debug, Clone)]
pub struct ConnectionGateway {
    ctx: Arc<NodeContext>,
}

impl ConnectionGateway {
    /// Create a gateway for the given node.
    #[must_use]
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// The node this gateway serves.
    #[must_use]
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Register an authenticated connection.
    ///
    /// Replaces any existing local session for the user without closing it,
    /// then claims the user for this node in the presence directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory write fails. The local session is
    /// kept in that case.
    pub async fn on_connect(&self, user_id: &str, handle: SessionHandle) -> Result<(), BackendError> {
        let connection = handle.connection_id().clone();
        if let Some(previous) = self.ctx.sessions().insert(user_id, handle) {
            warn!(
                user = %user_id,
                previous = %previous.connection_id(),
                "Replaced existing local session, previous connection left open"
            );
        }

        self.ctx
            .directory()
            .set(user_id, self.ctx.node_id())
            .await
            .map_err(|e| {
                error!(user = %user_id, error = %e, "Failed to record presence");
                e
            })?;

        debug!(user = %user_id, connection = %connection, node = %self.ctx.node_id(), "User connected");
        Ok(())
    }

    /// Forget a connection.
    ///
    /// Removes the local session and deletes the directory entry even if the
    /// directory now names a different node. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory delete fails.
    pub async fn on_disconnect(&self, user_id: &str) -> Result<(), BackendError> {
        let removed = self.ctx.sessions().remove(user_id).is_some();

        self.ctx.directory().delete(user_id).await.map_err(|e| {
            error!(user = %user_id, error = %e, "Failed to clear presence");
            e
        })?;

        debug!(user = %user_id, had_session = removed, "User disconnected");
        Ok(())
    }

    /// Write an envelope to the user's local connection.
    ///
    /// Returns whether the envelope was handed to an open connection. A
    /// missing session, a closed handle or an encoding failure all yield
    /// `false`; nothing is retried.
    pub async fn deliver_local(&self, user_id: &str, envelope: &Envelope) -> bool {
        let Some(handle) = self.ctx.sessions().get(user_id) else {
            debug!(user = %user_id, "No local session");
            return false;
        };

        if !handle.is_open() {
            debug!(user = %user_id, connection = %handle.connection_id(), "Local session closed");
            return false;
        }

        let text = match codec::encode(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Failed to encode envelope");
                return false;
            }
        };

        let delivered = handle.send(text).await;
        if !delivered {
            debug!(user = %user_id, connection = %handle.connection_id(), "Session closed during delivery");
        }
        delivered
    }

    /// Parse a client frame and append it to the ingestion queue.
    ///
    /// Malformed payloads are logged and dropped; the caller keeps the
    /// connection open either way.
    ///
    /// # Errors
    ///
    /// Returns the reason the payload was not queued.
    pub async fn on_inbound_payload(&self, user_id: &str, raw: &[u8]) -> Result<(), IngestError> {
        let envelope = codec::parse_inbound_bytes(raw).map_err(|e| {
            warn!(user = %user_id, error = %e, "Dropping malformed payload");
            self.ctx.stats().record_malformed();
            e
        })?;

        self.ctx.queue().publish(&envelope).await.map_err(|e| {
            error!(user = %user_id, error = %e, "Failed to enqueue message");
            e
        })?;

        debug!(
            user = %user_id,
            receiver = envelope.receiver().unwrap_or("-"),
            kind = %envelope.kind,
            "Message enqueued"
        );
        Ok(())
    }
}
