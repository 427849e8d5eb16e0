//! AMQP ingestion queue.
//!
//! Envelopes are published to a topic exchange with a fixed routing key and
//! land in one durable queue that every node consumes from. Consumers use
//! broker-side auto-acknowledgement: an envelope counts as handled the moment
//! it is handed to a consumer, so one lost with its node is not redelivered.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use switchboard_core::{BackendError, IngestionQueue, QueueConsumer};
use switchboard_protocol::{codec, Envelope};
use tracing::{debug, info, warn};

use crate::error::BrokerError;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Names of the queue, exchange and routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpTopology {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Default for AmqpTopology {
    fn default() -> Self {
        Self {
            queue: "chat.queue".to_string(),
            exchange: "chat.exchange".to_string(),
            routing_key: "chat.message".to_string(),
        }
    }
}

/// Ingestion queue on an AMQP broker.
pub struct AmqpQueue {
    _connection: Connection,
    channel: Channel,
    topology: AmqpTopology,
    consumer_prefix: String,
    consumers: AtomicUsize,
}

impl AmqpQueue {
    /// Connect to `uri` and declare the exchange, queue and binding.
    ///
    /// `consumer_prefix` tags this node's consumers so they can be told apart
    /// in the broker's management view.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unreachable or a declaration fails.
    pub async fn connect(
        uri: &str,
        topology: AmqpTopology,
        consumer_prefix: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %topology.queue,
            exchange = %topology.exchange,
            routing_key = %topology.routing_key,
            "Ingestion queue declared"
        );

        Ok(Self {
            _connection: connection,
            channel,
            topology,
            consumer_prefix: consumer_prefix.into(),
            consumers: AtomicUsize::new(0),
        })
    }

    /// The names this queue was declared with.
    #[must_use]
    pub fn topology(&self) -> &AmqpTopology {
        &self.topology
    }
}

fn unavailable(err: lapin::Error) -> BackendError {
    BrokerError::from(err).into()
}

#[async_trait]
impl IngestionQueue for AmqpQueue {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BackendError> {
        let payload = codec::encode(envelope)?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        self.channel
            .basic_publish(
                &self.topology.exchange,
                &self.topology.routing_key,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                properties,
            )
            .await
            .map_err(unavailable)?
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn consumer(&self) -> Result<Box<dyn QueueConsumer>, BackendError> {
        let n = self.consumers.fetch_add(1, Ordering::Relaxed);
        let tag = format!("{}-{}", self.consumer_prefix, n);

        let consumer = self
            .channel
            .basic_consume(
                &self.topology.queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        debug!(queue = %self.topology.queue, tag = %tag, "Consumer registered");
        Ok(Box::new(AmqpConsumer { consumer }))
    }
}

struct AmqpConsumer {
    consumer: lapin::Consumer,
}

#[async_trait]
impl QueueConsumer for AmqpConsumer {
    async fn next(&mut self) -> Result<Option<Envelope>, BackendError> {
        while let Some(delivery) = self.consumer.next().await {
            let delivery = delivery.map_err(unavailable)?;
            match codec::decode(&delivery.data) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => warn!(error = %e, "Discarding undecodable queue message"),
            }
        }
        Ok(None)
    }
}
