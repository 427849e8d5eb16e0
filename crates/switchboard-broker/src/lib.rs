//! # switchboard-broker
//!
//! Production backends for the Switchboard chat gateway.
//!
//! - **Redis** - presence directory (`SET`/`GET`/`DEL` on
//!   `user_session:{id}`) and the relay bus (`PUBLISH`/`SUBSCRIBE` on one
//!   channel)
//! - **AMQP** - the ingestion queue: one durable queue bound to a topic
//!   exchange with a fixed routing key
//!
//! Each backend sits behind a cargo feature and implements the matching
//! trait from `switchboard-core`, so the server can swap them for the
//! in-memory versions without touching routing code.
//!
//! ```rust,ignore
//! use switchboard_broker::{RedisDirectory, RedisBus, AmqpQueue, AmqpTopology};
//!
//! let directory = RedisDirectory::connect("redis://127.0.0.1/").await?;
//! let bus = RedisBus::connect("redis://127.0.0.1/", "chat_channel").await?;
//! let queue = AmqpQueue::connect("amqp://127.0.0.1:5672/%2f", AmqpTopology::default(), "node-1").await?;
//! ```

pub mod error;

#[cfg(feature = "redis")]
pub mod presence;

#[cfg(feature = "redis")]
pub mod relay;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::BrokerError;

#[cfg(feature = "redis")]
pub use presence::RedisDirectory;

#[cfg(feature = "redis")]
pub use relay::{RedisBus, DEFAULT_RELAY_CHANNEL};

#[cfg(feature = "amqp")]
pub use amqp::{AmqpQueue, AmqpTopology};
