//! # switchboard-core
//!
//! Presence routing and cross-node relay for the Switchboard chat gateway.
//!
//! A cluster runs any number of gateway nodes. A user's live connection sits
//! on exactly one of them, and no node can see another node's connections.
//! This crate provides the pieces that still get a message to the right
//! place:
//!
//! - **Node identity** - a per-process id stored in the presence directory
//! - **Session table** - this node's live connections, keyed by user
//! - **Presence directory** - shared user → node map
//! - **Ingestion queue** - competing-consumers buffer for inbound messages
//! - **Relay bus** - broadcast channel reaching every node
//! - **Gateway** - connection lifecycle and local delivery
//! - **Router** - queue/bus dispatch with single-owner delivery
//!
//! ## Architecture
//!
//! ```text
//! client ──▶ Gateway ──▶ IngestionQueue ──▶ Router (any node)
//!                                              │
//!                         owner == this node? ─┼─ yes ──▶ Gateway::deliver_local
//!                                              │
//!                                              └─ no ───▶ RelayBus ──▶ Router (every node)
//!                                                                          │
//!                                                          owner == this node? ──▶ deliver
//! ```
//!
//! Backends are traits. In-memory implementations live here; the Redis and
//! AMQP ones are in `switchboard-broker`.

pub mod bus;
pub mod context;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod node;
pub mod queue;
pub mod router;
pub mod session;

pub use bus::{BusSubscription, MemoryBus, RelayBus};
pub use context::NodeContext;
pub use directory::{presence_key, MemoryDirectory, PresenceDirectory, PRESENCE_KEY_PREFIX};
pub use error::BackendError;
pub use gateway::{ConnectionGateway, IngestError};
pub use node::NodeId;
pub use queue::{IngestionQueue, MemoryQueue, QueueConsumer};
pub use router::{DropReason, RouteOutcome, Router, RouterStats, StatsSnapshot};
pub use session::{ConnectionId, SessionHandle, SessionTable, DEFAULT_OUTBOUND_CAPACITY};
