//! Redis-backed presence directory.
//!
//! Each entry is a plain string key `user_session:{user}` holding the owning
//! node id. Keys are written without a TTL.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use switchboard_core::{presence_key, BackendError, NodeId, PresenceDirectory};
use tracing::{info, warn};

use crate::error::BrokerError;

/// Presence directory stored in Redis.
#[derive(Clone)]
pub struct RedisDirectory {
    conn: ConnectionManager,
}

impl RedisDirectory {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Presence directory connected to Redis");
        Ok(Self { conn })
    }

    /// Use an existing connection manager.
    #[must_use]
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn unavailable(op: &'static str, user_id: &str, err: redis::RedisError) -> BackendError {
    warn!(user = %user_id, error = %err, "Redis {} failed", op);
    BrokerError::from(err).into()
}

#[async_trait]
impl PresenceDirectory for RedisDirectory {
    async fn set(&self, user_id: &str, node: &NodeId) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(presence_key(user_id), node.as_str())
            .await
            .map_err(|e| unavailable("SET", user_id, e))
    }

    async fn get(&self, user_id: &str) -> Result<Option<NodeId>, BackendError> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = conn
            .get(presence_key(user_id))
            .await
            .map_err(|e| unavailable("GET", user_id, e))?;
        Ok(owner.map(NodeId::from))
    }

    async fn delete(&self, user_id: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(presence_key(user_id))
            .await
            .map_err(|e| unavailable("DEL", user_id, e))
    }
}
