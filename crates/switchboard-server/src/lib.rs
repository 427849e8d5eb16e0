//! # switchboard-server
//!
//! The `switchboard` chat gateway: JWT-authenticated WebSocket sessions on
//! top of `switchboard-core`, with backends chosen from configuration.
//!
//! ```rust,ignore
//! use switchboard_core::NodeId;
//! use switchboard_server::{backends, config::Config, handlers};
//!
//! let config = Config::load()?;
//! let node_id = NodeId::generate(config.node.resolve_hostname().as_deref(), config.port);
//! let ctx = backends::build_context(&config, node_id).await?;
//! handlers::run_server(config, ctx).await?;
//! ```

pub mod auth;
pub mod backends;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use auth::{AuthError, Authenticator};
pub use config::Config;
pub use handlers::{run_server, serve, AppState};
