//! JSON codec for client payloads and envelopes.
//!
//! Clients, the ingestion queue and the relay bus all speak the same textual
//! JSON format, so one codec serves every hop.

use thiserror::Error;

use crate::envelope::{Envelope, InboundPayload};

/// Maximum accepted payload size (64 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload exceeds maximum size.
    #[error("Payload size {0} exceeds maximum {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    /// Payload is not valid UTF-8.
    #[error("Payload is not valid UTF-8")]
    NotUtf8,

    /// JSON encoding or decoding failed.
    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse a client payload and normalize it into an [`Envelope`].
///
/// # Errors
///
/// Returns an error if the payload is too large, is not a JSON object, or
/// carries a field of the wrong type.
pub fn parse_inbound(raw: &str) -> Result<Envelope, ProtocolError> {
    check_size(raw.len())?;
    let payload: InboundPayload = serde_json::from_str(raw)?;
    Ok(payload.into_envelope())
}

/// Parse a client payload from raw bytes (binary frames).
///
/// # Errors
///
/// Returns an error if the bytes are not UTF-8 or [`parse_inbound`] fails.
pub fn parse_inbound_bytes(raw: &[u8]) -> Result<Envelope, ProtocolError> {
    check_size(raw.len())?;
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::NotUtf8)?;
    parse_inbound(text)
}

/// Encode an envelope as JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode an envelope from JSON bytes.
///
/// # Errors
///
/// Returns an error if the data is too large or is not an envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    check_size(data.len())?;
    Ok(serde_json::from_slice(data)?)
}

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    Ok(())
}
