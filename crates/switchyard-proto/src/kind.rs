//! Envelope kinds and room kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of room a connection is attached to.
///
/// Chat rooms carry conversation traffic, call rooms carry signaling. The
/// kind is fixed when the room is created and decides which envelope kinds
/// the room accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// Conversation room
    Chat,
    /// Call-signaling room
    Call,
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Call => write!(f, "call"),
        }
    }
}

/// Closed set of envelope kinds.
///
/// The discriminant is the JSON `type` field. Anything outside this set is
/// rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Chat message
    Message,
    /// Typing indicator
    Typing,
    /// Presence update
    Presence,
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// ICE candidate
    IceCandidate,
    /// Explicit call join
    Join,
    /// Explicit call leave
    Leave,
    /// Audio mute toggle
    MuteAudio,
    /// Video mute toggle
    MuteVideo,
    /// A member joined the room (server-emitted)
    Joined,
    /// A member left the room (server-emitted)
    Left,
    /// A member resumed a session (server-emitted)
    Reconnected,
    /// Error report (server-emitted)
    Error,
}

impl Kind {
    /// Every kind, in wire order.
    pub const ALL: [Kind; 14] = [
        Kind::Message,
        Kind::Typing,
        Kind::Presence,
        Kind::Offer,
        Kind::Answer,
        Kind::IceCandidate,
        Kind::Join,
        Kind::Leave,
        Kind::MuteAudio,
        Kind::MuteVideo,
        Kind::Joined,
        Kind::Left,
        Kind::Reconnected,
        Kind::Error,
    ];

    /// Wire name used in the `type` field.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Typing => "typing",
            Self::Presence => "presence",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::MuteAudio => "mute_audio",
            Self::MuteVideo => "mute_video",
            Self::Joined => "joined",
            Self::Left => "left",
            Self::Reconnected => "reconnected",
            Self::Error => "error",
        }
    }

    /// Look up a kind by its wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Kinds only the server may emit.
    pub const fn is_server_emitted(self) -> bool {
        matches!(self, Self::Joined | Self::Left | Self::Reconnected | Self::Error)
    }

    /// Kinds that may be dropped when a connection's outbound queue is full.
    ///
    /// Typing indicators and presence updates are superseded by the next one,
    /// so losing one is harmless. Everything else is reliability-critical.
    pub const fn is_droppable(self) -> bool {
        matches!(self, Self::Typing | Self::Presence)
    }

    /// Signaling kinds relayed verbatim between call participants.
    pub const fn is_signaling(self) -> bool {
        matches!(
            self,
            Self::Offer
                | Self::Answer
                | Self::IceCandidate
                | Self::Join
                | Self::Leave
                | Self::MuteAudio
                | Self::MuteVideo
        )
    }

    /// Whether a client may send this kind into a room of the given kind.
    ///
    /// Server-emitted kinds are never accepted from clients.
    pub const fn accepted_in(self, room: RoomKind) -> bool {
        match room {
            RoomKind::Chat => matches!(self, Self::Message | Self::Typing | Self::Presence),
            RoomKind::Call => self.is_signaling(),
        }
    }

    /// Whether this kind carries a correlation id on the wire.
    pub const fn is_correlated(self) -> bool {
        matches!(self, Self::Offer | Self::Answer)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Kind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Kind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::from_wire(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown envelope type: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for kind in Kind::ALL {
            assert_eq!(Kind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(Kind::from_wire("hello"), None);
        assert_eq!(Kind::from_wire("Message"), None);
    }

    #[test]
    fn dispatch_table_is_closed() {
        let chat: Vec<Kind> =
            Kind::ALL.into_iter().filter(|k| k.accepted_in(RoomKind::Chat)).collect();
        assert_eq!(chat, vec![Kind::Message, Kind::Typing, Kind::Presence]);

        let call: Vec<Kind> =
            Kind::ALL.into_iter().filter(|k| k.accepted_in(RoomKind::Call)).collect();
        assert_eq!(call.len(), 7);
        assert!(call.iter().all(|k| k.is_signaling()));

        for kind in Kind::ALL.into_iter().filter(|k| k.is_server_emitted()) {
            assert!(!kind.accepted_in(RoomKind::Chat));
            assert!(!kind.accepted_in(RoomKind::Call));
        }
    }

    #[test]
    fn only_ephemeral_kinds_are_droppable() {
        let droppable: Vec<Kind> = Kind::ALL.into_iter().filter(|k| k.is_droppable()).collect();
        assert_eq!(droppable, vec![Kind::Typing, Kind::Presence]);
    }
}
