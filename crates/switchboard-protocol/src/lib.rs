//! # switchboard-protocol
//!
//! Wire types for the Switchboard chat gateway.
//!
//! Clients send an [`InboundPayload`] as a JSON text frame. The gateway
//! normalizes it into an [`Envelope`], which is the record that travels
//! through the ingestion queue, the relay bus and, finally, back out to the
//! recipient's connection.
//!
//! ## Example
//!
//! ```rust
//! use switchboard_protocol::{codec, MessageKind};
//!
//! let raw = r#"{"content":"hi","senderId":"A","targetUserId":"B"}"#;
//! let envelope = codec::parse_inbound(raw).unwrap();
//!
//! assert_eq!(envelope.receiver_id.as_deref(), Some("B"));
//! assert_eq!(envelope.kind, MessageKind::Text);
//!
//! let json = codec::encode(&envelope).unwrap();
//! assert!(json.contains(r#""receiverId":"B""#));
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, parse_inbound, parse_inbound_bytes, ProtocolError, MAX_PAYLOAD_SIZE};
pub use envelope::{Envelope, InboundPayload, MessageKind};
