//! Envelopes: the unit of real-time delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{ErrorPayload, Kind, Payload, ProtocolError, Result, RoomKind};

/// Sender id stamped on envelopes the server emits on its own behalf.
pub const SERVER_SENDER: Uuid = Uuid::nil();

/// One typed real-time message.
///
/// The payload decides the kind. `correlation_id` is only ever present on
/// `offer` and `answer`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Room the envelope belongs to
    pub room_id: Uuid,
    /// Identity of the sender ([`SERVER_SENDER`] for server reports)
    pub sender_id: Uuid,
    /// Kind-specific body
    pub payload: Payload,
    /// Server-stamped time
    pub timestamp: DateTime<Utc>,
    /// Pairs an answer with its offer
    pub correlation_id: Option<Uuid>,
}

impl Envelope {
    /// Create an envelope without a correlation id.
    pub fn new(room_id: Uuid, sender_id: Uuid, payload: Payload, timestamp: DateTime<Utc>) -> Self {
        Self { room_id, sender_id, payload, timestamp, correlation_id: None }
    }

    /// Server-emitted `error` envelope.
    pub fn error(room_id: Uuid, error: ErrorPayload, timestamp: DateTime<Utc>) -> Self {
        Self::new(room_id, SERVER_SENDER, Payload::Error(error), timestamp)
    }

    /// Attach a correlation id. Ignored for kinds that do not carry one.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        if self.kind().is_correlated() {
            self.correlation_id = Some(correlation_id);
        }
        self
    }

    /// Envelope kind.
    pub const fn kind(&self) -> Kind {
        self.payload.kind()
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse the JSON wire form.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Malformed` if the outer object is not an envelope
    /// - `ProtocolError::UnknownKind` if `type` is not a known kind
    /// - Any payload error from [`Payload::decode`]
    pub fn from_json(text: &str) -> Result<Self> {
        let wire: WireEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        wire.into_envelope()
    }
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    #[serde(rename = "type")]
    kind: Kind,
    room_id: Uuid,
    sender_id: Uuid,
    payload: &'a Payload,
    timestamp: &'a DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    room_id: Uuid,
    sender_id: Uuid,
    #[serde(default)]
    payload: Value,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    correlation_id: Option<Uuid>,
}

impl WireEnvelope {
    fn into_envelope(self) -> Result<Envelope> {
        let kind = Kind::from_wire(&self.kind).ok_or(ProtocolError::UnknownKind(self.kind))?;
        let payload = Payload::decode(kind, self.payload)?;
        let correlation_id = self.correlation_id.filter(|_| kind.is_correlated());

        Ok(Envelope {
            room_id: self.room_id,
            sender_id: self.sender_id,
            payload,
            timestamp: self.timestamp,
            correlation_id,
        })
    }
}

impl Serialize for Envelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        WireEnvelopeRef {
            kind: self.kind(),
            room_id: self.room_id,
            sender_id: self.sender_id,
            payload: &self.payload,
            timestamp: &self.timestamp,
            correlation_id: self.correlation_id,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        WireEnvelope::deserialize(deserializer)?.into_envelope().map_err(serde::de::Error::custom)
    }
}

/// Envelope as sent by a client, before the server stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    /// Kind-specific body
    pub payload: Payload,
    /// Correlation id supplied by the client (offer/answer only)
    pub correlation_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct WireClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    correlation_id: Option<Uuid>,
}

#[derive(Serialize)]
struct WireClientFrameRef<'a> {
    #[serde(rename = "type")]
    kind: Kind,
    payload: &'a Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Uuid>,
}

impl ClientFrame {
    /// Create a frame without a correlation id.
    pub fn new(payload: Payload) -> Self {
        Self { payload, correlation_id: None }
    }

    /// Parse a client text frame.
    ///
    /// Correlation ids on kinds other than `offer`/`answer` are discarded.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Malformed` if the outer object is not a frame
    /// - `ProtocolError::UnknownKind` for unknown `type` values
    /// - `ProtocolError::ServerOnly` for server-emitted kinds
    /// - Any payload error from [`Payload::decode`]
    pub fn parse(text: &str) -> Result<Self> {
        let wire: WireClientFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = Kind::from_wire(&wire.kind).ok_or(ProtocolError::UnknownKind(wire.kind))?;
        if kind.is_server_emitted() {
            return Err(ProtocolError::ServerOnly(kind));
        }

        let payload = Payload::decode(kind, wire.payload)?;
        let correlation_id = wire.correlation_id.filter(|_| kind.is_correlated());

        Ok(Self { payload, correlation_id })
    }

    /// Serialize to the JSON client form.
    pub fn to_json(&self) -> Result<String> {
        let wire = WireClientFrameRef {
            kind: self.kind(),
            payload: &self.payload,
            correlation_id: self.correlation_id,
        };
        serde_json::to_string(&wire).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Envelope kind.
    pub const fn kind(&self) -> Kind {
        self.payload.kind()
    }

    /// Reject kinds that the room does not accept.
    pub fn check_room(&self, room: RoomKind) -> Result<()> {
        let kind = self.kind();
        if kind.accepted_in(room) {
            Ok(())
        } else {
            Err(ProtocolError::WrongRoomKind { kind, room })
        }
    }

    /// Stamp room, sender and time onto the frame.
    ///
    /// An `offer` without a correlation id gets one from `fresh_correlation`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MissingCorrelation` for an `answer` without one
    pub fn into_envelope(
        self,
        room_id: Uuid,
        sender_id: Uuid,
        timestamp: DateTime<Utc>,
        fresh_correlation: impl FnOnce() -> Uuid,
    ) -> Result<Envelope> {
        let correlation_id = match (self.kind(), self.correlation_id) {
            (Kind::Offer, None) => Some(fresh_correlation()),
            (Kind::Answer, None) => return Err(ProtocolError::MissingCorrelation),
            (_, id) => id,
        };

        Ok(Envelope { room_id, sender_id, payload: self.payload, timestamp, correlation_id })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::{Message, Typing};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn room() -> Uuid {
        Uuid::from_u128(0x1111)
    }

    fn alice() -> Uuid {
        Uuid::from_u128(0xA11CE)
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(room(), alice(), Payload::Message(Message::text("hello")), ts());
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "message",
                "room_id": room(),
                "sender_id": alice(),
                "payload": { "content": "hello", "is_encrypted": false },
                "timestamp": "2026-03-01T12:00:00Z"
            })
        );
    }

    #[test]
    fn envelope_json_round_trip_keeps_correlation_for_offer() {
        let offer = Payload::decode(Kind::Offer, json!({ "sdp": "v=0" })).unwrap();
        let env = Envelope::new(room(), alice(), offer, ts()).with_correlation(Uuid::from_u128(7));

        let decoded = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.correlation_id, Some(Uuid::from_u128(7)));
    }

    #[test]
    fn correlation_dropped_for_other_kinds() {
        let env = Envelope::new(room(), alice(), Payload::Typing(Typing { is_typing: true }), ts())
            .with_correlation(Uuid::from_u128(7));
        assert_eq!(env.correlation_id, None);

        let frame =
            ClientFrame::parse(r#"{"type":"typing","payload":{"is_typing":true},"correlation_id":"00000000-0000-0000-0000-000000000007"}"#)
                .unwrap();
        assert_eq!(frame.correlation_id, None);
    }

    #[test]
    fn unknown_kind_rejected() {
        let err = ClientFrame::parse(r#"{"type":"screen_share","payload":{}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownKind("screen_share".to_string()));

        let text = json!({
            "type": "wave",
            "room_id": room(),
            "sender_id": alice(),
            "payload": {},
            "timestamp": "2026-03-01T12:00:00Z"
        })
        .to_string();
        assert_eq!(Envelope::from_json(&text).unwrap_err(), ProtocolError::UnknownKind("wave".into()));
    }

    #[test]
    fn malformed_frame_rejected() {
        assert!(matches!(ClientFrame::parse("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(ClientFrame::parse(r#"{"payload":{}}"#), Err(ProtocolError::Malformed(_))));
        assert!(matches!(ClientFrame::parse("[1,2]"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn clients_cannot_send_server_kinds() {
        let err = ClientFrame::parse(r#"{"type":"joined","payload":{"member_count":1}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::ServerOnly(Kind::Joined));
    }

    #[test]
    fn offer_gets_fresh_correlation() {
        let frame = ClientFrame::parse(r#"{"type":"offer","payload":{"sdp":"v=0"}}"#).unwrap();
        let env = frame.into_envelope(room(), alice(), ts(), || Uuid::from_u128(42)).unwrap();
        assert_eq!(env.correlation_id, Some(Uuid::from_u128(42)));
        assert_eq!(env.sender_id, alice());
    }

    #[test]
    fn offer_keeps_client_correlation() {
        let frame = ClientFrame::parse(
            r#"{"type":"offer","payload":{"sdp":"v=0"},"correlation_id":"00000000-0000-0000-0000-000000000009"}"#,
        )
        .unwrap();
        let env = frame.into_envelope(room(), alice(), ts(), || Uuid::from_u128(42)).unwrap();
        assert_eq!(env.correlation_id, Some(Uuid::from_u128(9)));
    }

    #[test]
    fn answer_requires_correlation() {
        let frame = ClientFrame::parse(r#"{"type":"answer","payload":{"sdp":"v=0"}}"#).unwrap();
        let err = frame.into_envelope(room(), alice(), ts(), Uuid::nil).unwrap_err();
        assert_eq!(err, ProtocolError::MissingCorrelation);
    }

    #[test]
    fn room_kind_check() {
        let frame = ClientFrame::parse(r#"{"type":"offer","payload":{"sdp":"v=0"}}"#).unwrap();
        assert!(frame.check_room(RoomKind::Call).is_ok());
        assert_eq!(frame.check_room(RoomKind::Chat).unwrap_err(), ProtocolError::WrongRoomKind {
            kind: Kind::Offer,
            room: RoomKind::Chat
        });
    }

    #[test]
    fn client_frame_to_json_parses_back() {
        let frame = ClientFrame::new(Payload::Message(Message::text("hi")));
        assert_eq!(ClientFrame::parse(&frame.to_json().unwrap()).unwrap(), frame);
    }

    #[test]
    fn error_envelope_is_server_sent() {
        let env = Envelope::error(room(), ErrorPayload::validation("bad"), ts());
        assert_eq!(env.sender_id, SERVER_SENDER);
        assert_eq!(env.kind(), Kind::Error);
    }
}
