//! Backend selection.
//!
//! Builds the node context from the `[directory]`, `[bus]` and `[queue]`
//! sections. The in-memory backends only connect nodes that share a
//! process, so a real cluster needs Redis and AMQP.

use anyhow::{Context, Result};
use std::sync::Arc;
use switchboard_broker::{AmqpQueue, AmqpTopology, RedisBus, RedisDirectory};
use switchboard_core::{
    IngestionQueue, MemoryBus, MemoryDirectory, MemoryQueue, NodeContext, NodeId,
    PresenceDirectory, RelayBus,
};
use tracing::{info, warn};

use crate::config::{Config, QueueBackend, StoreBackend};

/// Connect the configured backends and build this node's context.
///
/// # Errors
///
/// Returns an error if a broker cannot be reached.
pub async fn build_context(config: &Config, node_id: NodeId) -> Result<Arc<NodeContext>> {
    let directory: Arc<dyn PresenceDirectory> = match config.directory.backend {
        StoreBackend::Memory => Arc::new(MemoryDirectory::new()),
        StoreBackend::Redis => Arc::new(
            RedisDirectory::connect(&config.directory.redis_url)
                .await
                .context("Failed to connect presence directory")?,
        ),
    };

    let bus: Arc<dyn RelayBus> = match config.bus.backend {
        StoreBackend::Memory => Arc::new(MemoryBus::new()),
        StoreBackend::Redis => Arc::new(
            RedisBus::connect(&config.bus.redis_url, config.bus.channel.clone())
                .await
                .context("Failed to connect relay bus")?,
        ),
    };

    let queue: Arc<dyn IngestionQueue> = match config.queue.backend {
        QueueBackend::Memory => Arc::new(MemoryQueue::new()),
        QueueBackend::Amqp => {
            let topology = AmqpTopology {
                queue: config.queue.queue.clone(),
                exchange: config.queue.exchange.clone(),
                routing_key: config.queue.routing_key.clone(),
            };
            Arc::new(
                AmqpQueue::connect(&config.queue.amqp_url, topology, node_id.as_str())
                    .await
                    .context("Failed to connect ingestion queue")?,
            )
        }
    };

    let any_memory = config.directory.backend == StoreBackend::Memory
        || config.bus.backend == StoreBackend::Memory
        || config.queue.backend == QueueBackend::Memory;
    if any_memory {
        warn!("In-memory backend selected, this node will not see other nodes");
    }

    info!(
        node = %node_id,
        directory = ?config.directory.backend,
        bus = ?config.bus.backend,
        queue = ?config.queue.backend,
        "Backends ready"
    );

    Ok(Arc::new(NodeContext::new(node_id, directory, queue, bus)))
}
