//! WebSocket close codes used by the hub.

use std::fmt;

/// Reason a session was closed by the server.
///
/// Codes in the 4000 range are application-defined and stable; clients key
/// their reconnect behavior off them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Normal closure
    Normal,
    /// Server is shutting down
    GoingAway,
    /// Too many protocol violations
    ProtocolViolation,
    /// Authorization failed after upgrade
    Forbidden,
    /// Heartbeat missed too many times
    HeartbeatTimeout,
    /// Outbound queue overflowed with reliability-critical envelopes, or an
    /// instance limit was reached
    ResourceExhausted,
    /// The call the session belongs to has ended
    TerminalState,
    /// The identity already has a session in the room
    DuplicateSession,
    /// The room could not be found for a reconnect
    RoomNotFound,
}

impl CloseCode {
    /// Numeric WebSocket close code.
    pub const fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolViolation => 4002,
            Self::Forbidden => 4003,
            Self::HeartbeatTimeout => 4004,
            Self::RoomNotFound => 4005,
            Self::ResourceExhausted => 4008,
            Self::TerminalState => 4009,
            Self::DuplicateSession => 4010,
        }
    }

    /// Short reason string sent in the close frame.
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::GoingAway => "server shutting down",
            Self::ProtocolViolation => "protocol violation",
            Self::Forbidden => "forbidden",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::RoomNotFound => "room not found",
            Self::ResourceExhausted => "resource exhausted",
            Self::TerminalState => "call ended",
            Self::DuplicateSession => "duplicate session",
        }
    }

    /// Look up a close code by number.
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            4002 => Some(Self::ProtocolViolation),
            4003 => Some(Self::Forbidden),
            4004 => Some(Self::HeartbeatTimeout),
            4005 => Some(Self::RoomNotFound),
            4008 => Some(Self::ResourceExhausted),
            4009 => Some(Self::TerminalState),
            4010 => Some(Self::DuplicateSession),
            _ => None,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}
