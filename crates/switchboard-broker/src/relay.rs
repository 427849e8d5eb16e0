//! Redis pub/sub relay bus.
//!
//! Every node publishes relayed envelopes as JSON on one channel and holds
//! its own subscription to it. Redis pub/sub keeps nothing: a node that is
//! not subscribed when an envelope is published never sees it.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use switchboard_core::{BackendError, BusSubscription, RelayBus};
use switchboard_protocol::{codec, Envelope};
use tracing::{debug, info, warn};

use crate::error::BrokerError;

/// Default pub/sub channel name.
pub const DEFAULT_RELAY_CHANNEL: &str = "chat_channel";

/// Relay bus on a Redis pub/sub channel.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
    channel: String,
}

impl RedisBus {
    /// Connect to Redis at `url` and relay on `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let channel = channel.into();
        info!(channel = %channel, "Relay bus connected to Redis");
        Ok(Self {
            client,
            conn,
            channel,
        })
    }

    /// The pub/sub channel in use.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl RelayBus for RedisBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BackendError> {
        let payload = codec::encode(envelope)?;
        let mut conn = self.conn.clone();
        let receivers: usize = conn
            .publish(&self.channel, payload)
            .await
            .map_err(|e| BackendError::from(BrokerError::from(e)))?;
        debug!(channel = %self.channel, receivers, "Relay published");
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn BusSubscription>, BackendError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BackendError::from(BrokerError::from(e)))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| BackendError::from(BrokerError::from(e)))?;

        info!(channel = %self.channel, "Subscribed to relay channel");
        Ok(Box::new(RedisSubscription {
            messages: pubsub.into_on_message().boxed(),
        }))
    }
}

struct RedisSubscription {
    messages: BoxStream<'static, redis::Msg>,
}

#[async_trait]
impl BusSubscription for RedisSubscription {
    async fn next(&mut self) -> Result<Option<Envelope>, BackendError> {
        while let Some(msg) = self.messages.next().await {
            match codec::decode(msg.get_payload_bytes()) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => warn!(error = %e, "Discarding undecodable relay message"),
            }
        }
        Ok(None)
    }
}
