//! Errors raised by shared backends.

use switchboard_protocol::ProtocolError;
use thiserror::Error;

/// Failure talking to the presence directory, ingestion queue or relay bus.
///
/// None of these are fatal to a node. Callers log them and drop the message
/// or connection event they were handling.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached or rejected the command.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend was shut down.
    #[error("Backend closed")]
    Closed,

    /// A message read from the backend could not be decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] ProtocolError),
}
