//! Presence directory.
//!
//! A cluster-wide map from user id to the [`NodeId`] that currently claims
//! the user's live connection. Entries have no expiry: one left behind by a
//! crashed node stays until the user connects again somewhere and overwrites
//! it.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::BackendError;
use crate::node::NodeId;

/// Prefix of every presence key in a shared store.
pub const PRESENCE_KEY_PREFIX: &str = "user_session:";

/// Build the shared-store key for a user.
#[must_use]
pub fn presence_key(user_id: &str) -> String {
    format!("{PRESENCE_KEY_PREFIX}{user_id}")
}

/// Shared user → node mapping.
///
/// Implementations are plain key operations with no transactions; readers
/// may observe an entry that is already stale.
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    /// Record that `node` owns `user_id`, overwriting any previous owner.
    async fn set(&self, user_id: &str, node: &NodeId) -> Result<(), BackendError>;

    /// The node currently claiming `user_id`, if any.
    async fn get(&self, user_id: &str) -> Result<Option<NodeId>, BackendError>;

    /// Remove the entry for `user_id`, whichever node it names.
    async fn delete(&self, user_id: &str) -> Result<(), BackendError>;

    /// Whether the directory names `node` as the owner of `user_id`.
    ///
    /// At most one node id is stored per user, so at most one node can ever
    /// see `true` for the same read.
    async fn is_owned_by(&self, user_id: &str, node: &NodeId) -> Result<bool, BackendError> {
        Ok(self.get(user_id).await?.as_ref() == Some(node))
    }
}

/// In-process directory for tests and single-node deployments.
///
/// Share one instance between several node contexts to simulate a cluster.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: DashMap<String, NodeId>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry exists for `user_id`.
    #[must_use]
    pub fn contains(&self, user_id: &str) -> bool {
        self.entries.contains_key(&presence_key(user_id))
    }
}

#[async_trait]
impl PresenceDirectory for MemoryDirectory {
    async fn set(&self, user_id: &str, node: &NodeId) -> Result<(), BackendError> {
        self.entries.insert(presence_key(user_id), node.clone());
        Ok(())
    }

    async fn get(&self, user_id: &str) -> Result<Option<NodeId>, BackendError> {
        Ok(self
            .entries
            .get(&presence_key(user_id))
            .map(|e| e.value().clone()))
    }

    async fn delete(&self, user_id: &str) -> Result<(), BackendError> {
        self.entries.remove(&presence_key(user_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_key() {
        assert_eq!(presence_key("42"), "user_session:42");
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let directory = MemoryDirectory::new();
        let n1 = NodeId::new("n1");

        assert_eq!(directory.get("alice").await.unwrap(), None);
        directory.set("alice", &n1).await.unwrap();
        assert_eq!(directory.get("alice").await.unwrap(), Some(n1.clone()));
        assert!(directory.contains("alice"));

        directory.delete("alice").await.unwrap();
        directory.delete("alice").await.unwrap();
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_last_writer_owns() {
        let directory = MemoryDirectory::new();
        let n1 = NodeId::new("n1");
        let n2 = NodeId::new("n2");

        directory.set("alice", &n1).await.unwrap();
        directory.set("alice", &n2).await.unwrap();

        assert!(!directory.is_owned_by("alice", &n1).await.unwrap());
        assert!(directory.is_owned_by("alice", &n2).await.unwrap());
        assert!(!directory.is_owned_by("bob", &n2).await.unwrap());
    }
}
