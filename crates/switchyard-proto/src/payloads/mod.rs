//! Kind-specific payload types.
//!
//! The payload object inside an envelope is selected by the envelope's `type`
//! field; it carries no tag of its own.

mod chat;
mod signal;
mod system;

pub use chat::{MAX_MESSAGE_LENGTH, Message, Presence, PresenceStatus, Typing};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
pub use signal::{CallControl, IceCandidate, Mute, SessionDescription};
pub use system::{ErrorPayload, MemberCount};
use uuid::Uuid;

use crate::{Kind, ProtocolError, Result};

/// Envelope payload.
///
/// One variant per [`Kind`]. The variant is decided by the envelope's `type`
/// field, so decoding always goes through [`Payload::decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Chat message
    Message(Message),
    /// Typing indicator
    Typing(Typing),
    /// Presence update
    Presence(Presence),
    /// SDP offer
    Offer(SessionDescription),
    /// SDP answer
    Answer(SessionDescription),
    /// ICE candidate
    IceCandidate(IceCandidate),
    /// Explicit call join
    Join(CallControl),
    /// Explicit call leave
    Leave(CallControl),
    /// Audio mute toggle
    MuteAudio(Mute),
    /// Video mute toggle
    MuteVideo(Mute),
    /// A member joined
    Joined(MemberCount),
    /// A member left
    Left(MemberCount),
    /// A member resumed its session
    Reconnected(MemberCount),
    /// Error report
    Error(ErrorPayload),
}

impl Payload {
    /// Envelope kind for this payload.
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Message(_) => Kind::Message,
            Self::Typing(_) => Kind::Typing,
            Self::Presence(_) => Kind::Presence,
            Self::Offer(_) => Kind::Offer,
            Self::Answer(_) => Kind::Answer,
            Self::IceCandidate(_) => Kind::IceCandidate,
            Self::Join(_) => Kind::Join,
            Self::Leave(_) => Kind::Leave,
            Self::MuteAudio(_) => Kind::MuteAudio,
            Self::MuteVideo(_) => Kind::MuteVideo,
            Self::Joined(_) => Kind::Joined,
            Self::Left(_) => Kind::Left,
            Self::Reconnected(_) => Kind::Reconnected,
            Self::Error(_) => Kind::Error,
        }
    }

    /// Decode a payload object according to `kind`.
    ///
    /// A missing or `null` payload is treated as an empty object so that
    /// field-less kinds like `join` may omit it.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidPayload` if the object does not match the kind
    /// - `ProtocolError::ContentTooLong` if a message body exceeds
    ///   [`MAX_MESSAGE_LENGTH`]
    pub fn decode(kind: Kind, value: Value) -> Result<Self> {
        let value = if value.is_null() { Value::Object(Map::new()) } else { value };

        let payload = match kind {
            Kind::Message => Self::Message(from_value(kind, value)?),
            Kind::Typing => Self::Typing(from_value(kind, value)?),
            Kind::Presence => Self::Presence(from_value(kind, value)?),
            Kind::Offer => Self::Offer(from_value(kind, value)?),
            Kind::Answer => Self::Answer(from_value(kind, value)?),
            Kind::IceCandidate => Self::IceCandidate(from_value(kind, value)?),
            Kind::Join => Self::Join(from_value(kind, value)?),
            Kind::Leave => Self::Leave(from_value(kind, value)?),
            Kind::MuteAudio => Self::MuteAudio(from_value(kind, value)?),
            Kind::MuteVideo => Self::MuteVideo(from_value(kind, value)?),
            Kind::Joined => Self::Joined(from_value(kind, value)?),
            Kind::Left => Self::Left(from_value(kind, value)?),
            Kind::Reconnected => Self::Reconnected(from_value(kind, value)?),
            Kind::Error => Self::Error(from_value(kind, value)?),
        };

        payload.validate()?;
        Ok(payload)
    }

    /// Check constraints that the type system does not capture.
    pub fn validate(&self) -> Result<()> {
        if let Self::Message(message) = self {
            if message.content.is_empty() {
                return Err(ProtocolError::InvalidPayload {
                    kind: Kind::Message,
                    reason: "content must not be empty".to_string(),
                });
            }

            let len = message.content.chars().count();
            if len > MAX_MESSAGE_LENGTH {
                return Err(ProtocolError::ContentTooLong { len, max: MAX_MESSAGE_LENGTH });
            }
        }

        Ok(())
    }

    /// Participant this payload is addressed to, if any.
    ///
    /// Signaling payloads may name a single recipient; everything else goes to
    /// the whole room.
    pub fn target_id(&self) -> Option<Uuid> {
        match self {
            Self::Offer(sd) | Self::Answer(sd) => sd.target_id,
            Self::IceCandidate(ice) => ice.target_id,
            Self::Join(ctl) | Self::Leave(ctl) => ctl.target_id,
            _ => None,
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Message(inner) => inner.serialize(serializer),
            Self::Typing(inner) => inner.serialize(serializer),
            Self::Presence(inner) => inner.serialize(serializer),
            Self::Offer(inner) | Self::Answer(inner) => inner.serialize(serializer),
            Self::IceCandidate(inner) => inner.serialize(serializer),
            Self::Join(inner) | Self::Leave(inner) => inner.serialize(serializer),
            Self::MuteAudio(inner) | Self::MuteVideo(inner) => inner.serialize(serializer),
            Self::Joined(inner) | Self::Left(inner) | Self::Reconnected(inner) => {
                inner.serialize(serializer)
            },
            Self::Error(inner) => inner.serialize(serializer),
        }
    }
}

fn from_value<T: DeserializeOwned>(kind: Kind, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| ProtocolError::InvalidPayload { kind, reason: e.to_string() })
}
