//! Broker connection errors.

use switchboard_core::BackendError;
use thiserror::Error;

/// Errors raised while connecting to or talking with a broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Redis error.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// AMQP error.
    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Envelope encoding error.
    #[error("Codec error: {0}")]
    Codec(#[from] switchboard_protocol::ProtocolError),
}

impl From<BrokerError> for BackendError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Codec(e) => BackendError::Codec(e),
            #[allow(unreachable_patterns)]
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}
