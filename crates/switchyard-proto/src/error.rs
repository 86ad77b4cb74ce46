//! Decoding errors for the wire contract.

use thiserror::Error;

use crate::{Kind, RoomKind};

/// Result alias for wire decoding.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while decoding or validating envelopes.
///
/// All of these are client faults. The server answers them with an `error`
/// envelope and counts them as protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The text is not a JSON object of the expected outer shape.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The `type` field names no known kind.
    #[error("unknown envelope type: {0:?}")]
    UnknownKind(String),

    /// The payload does not match the shape required by its kind.
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Kind whose payload failed to decode
        kind: Kind,
        /// Decoder message
        reason: String,
    },

    /// A `message` payload exceeds the content limit.
    #[error("message content too long: {len} > {max} characters")]
    ContentTooLong {
        /// Length of the offending content in characters
        len: usize,
        /// Maximum allowed
        max: usize,
    },

    /// A kind only the server may emit was sent by a client.
    #[error("{0} envelopes are server-emitted")]
    ServerOnly(Kind),

    /// The kind is not accepted in this room kind.
    #[error("{kind} is not valid in a {room} room")]
    WrongRoomKind {
        /// Kind that was sent
        kind: Kind,
        /// Kind of the room it was sent to
        room: RoomKind,
    },

    /// An `answer` arrived without the correlation id of its offer.
    #[error("answer requires a correlation_id")]
    MissingCorrelation,
}
