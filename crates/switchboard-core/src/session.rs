//! Node-local session table.
//!
//! The table maps a user id to the outbound side of that user's live
//! connection on this node. It is the only state shared between connection
//! tasks, queue consumers and the relay listener, so it is backed by a
//! sharded concurrent map and needs no locking from callers.

use dashmap::DashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Default capacity of a session's outbound buffer.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle used to write to one live connection.
///
/// The connection's own task owns the receiving half and writes whatever
/// arrives to the socket. Once that task ends the handle reports closed,
/// even if it is still sitting in the table.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    connection_id: ConnectionId,
    outbound: mpsc::Sender<String>,
}

impl SessionHandle {
    /// Create a handle and the receiver the connection task drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let handle = Self {
            connection_id: ConnectionId::generate(),
            outbound,
        };
        (handle, rx)
    }

    /// The connection this handle writes to.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Whether the connection task is still draining this handle.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue serialized text for the connection.
    ///
    /// Waits while the outbound buffer is full. Returns `false` if the
    /// connection has gone away.
    pub async fn send(&self, text: String) -> bool {
        self.outbound.send(text).await.is_ok()
    }
}

/// Live connections on this node, keyed by user id.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, replacing any existing one for the same user.
    ///
    /// The replaced handle is returned but not closed; its connection keeps
    /// running until the client or the heartbeat ends it.
    pub fn insert(&self, user_id: &str, handle: SessionHandle) -> Option<SessionHandle> {
        let previous = self.sessions.insert(user_id.to_string(), handle);
        debug!(user = %user_id, replaced = previous.is_some(), "Session inserted");
        previous
    }

    /// Look up the session for a user.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<SessionHandle> {
        self.sessions.get(user_id).map(|entry| entry.value().clone())
    }

    /// Remove the session for a user.
    pub fn remove(&self, user_id: &str) -> Option<SessionHandle> {
        self.sessions.remove(user_id).map(|(_, handle)| handle)
    }

    /// Check whether a user has a local session.
    #[must_use]
    pub fn contains(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    /// Number of local sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of all locally connected users.
    #[must_use]
    pub fn user_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_insert_replaces_without_closing() {
        let table = SessionTable::new();
        let (first, _rx1) = SessionHandle::channel(4);
        let (second, _rx2) = SessionHandle::channel(4);
        let first_id = first.connection_id().clone();

        assert!(table.insert("alice", first).is_none());
        let replaced = table.insert("alice", second.clone()).unwrap();

        assert_eq!(replaced.connection_id(), &first_id);
        assert!(replaced.is_open());
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get("alice").unwrap().connection_id(),
            second.connection_id()
        );
    }

    #[test]
    fn test_remove_twice() {
        let table = SessionTable::new();
        let (handle, _rx) = SessionHandle::channel(4);
        table.insert("alice", handle);

        assert!(table.remove("alice").is_some());
        assert!(table.remove("alice").is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_handle_reports_closed_after_receiver_drops() {
        let (handle, mut rx) = SessionHandle::channel(4);
        assert!(handle.send("one".to_string()).await);
        assert_eq!(rx.recv().await.as_deref(), Some("one"));

        drop(rx);
        assert!(!handle.is_open());
        assert!(!handle.send("two".to_string()).await);
    }
}
