//! Switchyard wire contract.
//!
//! Everything a client or a peer instance sees on the wire lives here: the
//! closed set of envelope [`Kind`]s, the kind-specific [`Payload`] shapes, the
//! [`Envelope`] itself, error codes carried by `error` envelopes, and the
//! WebSocket [`CloseCode`]s the server uses when it ends a session.
//!
//! # Wire format
//!
//! Envelopes are JSON objects:
//!
//! ```json
//! {
//!   "type": "message",
//!   "room_id": "6f1c...",
//!   "sender_id": "0b7e...",
//!   "payload": { "content": "hi" },
//!   "timestamp": "2026-01-01T12:00:00Z"
//! }
//! ```
//!
//! `offer` and `answer` additionally carry `correlation_id`. Clients send the
//! reduced [`ClientFrame`] form `{type, payload, correlation_id?}` and the
//! server stamps room, sender, and time.
//!
//! The payload object is decoded according to `type`, like a frame header
//! opcode selecting the payload struct. The variant tag is never serialized
//! inside the payload.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod close;
pub mod envelope;
pub mod error;
pub mod kind;
pub mod payloads;

pub use close::CloseCode;
pub use envelope::{ClientFrame, Envelope, SERVER_SENDER};
pub use error::{ProtocolError, Result};
pub use kind::{Kind, RoomKind};
pub use payloads::{
    CallControl, ErrorPayload, IceCandidate, MAX_MESSAGE_LENGTH, MemberCount, Message, Mute,
    Payload, Presence, PresenceStatus, SessionDescription, Typing,
};
