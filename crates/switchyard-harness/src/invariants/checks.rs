//! Membership invariants.

use std::collections::{BTreeMap, BTreeSet};

use switchyard_server::{ConnectionId, RegistrySnapshot};
use uuid::Uuid;

use super::{Invariant, InvariantResult, Violation};

/// Rooms and connections describe the same membership.
///
/// Every member of a room is a known connection whose room is that room, and
/// every connection is a member of exactly the room it names.
pub struct MemberIndexConsistent;

impl Invariant for MemberIndexConsistent {
    fn name(&self) -> &'static str {
        "member_index_consistent"
    }

    fn check(&self, state: &RegistrySnapshot) -> InvariantResult {
        let rooms_of: BTreeMap<ConnectionId, Uuid> =
            state.connections.iter().map(|c| (c.connection_id, c.room_id)).collect();

        let mut seen = BTreeSet::new();
        for room in &state.rooms {
            for member in &room.members {
                match rooms_of.get(member) {
                    Some(room_id) if *room_id == room.room_id => {},
                    Some(room_id) => {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!(
                                "connection {member} listed in room {} but belongs to {room_id}",
                                room.room_id
                            ),
                        });
                    },
                    None => {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!("room {} lists unknown connection {member}", room.room_id),
                        });
                    },
                }
                if !seen.insert(*member) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!("connection {member} is a member of several rooms"),
                    });
                }
            }
        }

        if let Some(orphan) = state.connections.iter().find(|c| !seen.contains(&c.connection_id)) {
            return Err(Violation {
                invariant: self.name(),
                message: format!(
                    "connection {} names room {} but no room lists it",
                    orphan.connection_id, orphan.room_id
                ),
            });
        }
        Ok(())
    }
}

/// Every local room owns its remote subscription.
///
/// A room without a subscription would never see envelopes published by
/// other instances.
pub struct SubscriptionPerRoom;

impl Invariant for SubscriptionPerRoom {
    fn name(&self) -> &'static str {
        "subscription_per_room"
    }

    fn check(&self, state: &RegistrySnapshot) -> InvariantResult {
        match state.rooms.iter().find(|room| !room.subscribed) {
            Some(room) => Err(Violation {
                invariant: self.name(),
                message: format!("room {} has no subscription", room.room_id),
            }),
            None => Ok(()),
        }
    }
}

/// A room with no members exists only while a recovery reservation holds it.
pub struct NoIdleRooms;

impl Invariant for NoIdleRooms {
    fn name(&self) -> &'static str {
        "no_idle_rooms"
    }

    fn check(&self, state: &RegistrySnapshot) -> InvariantResult {
        match state.rooms.iter().find(|room| room.members.is_empty() && !room.reserved) {
            Some(room) => Err(Violation {
                invariant: self.name(),
                message: format!("room {} is empty and unreserved", room.room_id),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use switchyard_proto::RoomKind;
    use switchyard_server::registry::{ConnectionSnapshot, RoomSnapshot};

    use super::*;
    use crate::InvariantRegistry;

    fn room(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn connection(id: u64, room_id: Uuid) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connection_id: ConnectionId(id),
            room_id,
            identity: Uuid::from_u128(u128::from(id) + 1000),
            closing: false,
        }
    }

    fn consistent() -> RegistrySnapshot {
        RegistrySnapshot {
            rooms: vec![
                RoomSnapshot {
                    room_id: room(1),
                    kind: RoomKind::Chat,
                    members: vec![ConnectionId(1), ConnectionId(2)],
                    subscribed: true,
                    reserved: false,
                },
                RoomSnapshot {
                    room_id: room(2),
                    kind: RoomKind::Call,
                    members: vec![],
                    subscribed: true,
                    reserved: true,
                },
            ],
            connections: vec![connection(1, room(1)), connection(2, room(1))],
        }
    }

    #[test]
    fn consistent_snapshot_passes() {
        InvariantRegistry::standard().assert_all(&consistent(), "in fixture");
        InvariantRegistry::standard().assert_all(&RegistrySnapshot::default(), "when empty");
    }

    #[test]
    fn member_in_wrong_room_detected() {
        let mut state = consistent();
        state.connections[1].room_id = room(2);
        let err = MemberIndexConsistent.check(&state).unwrap_err();
        assert_eq!(err.invariant, "member_index_consistent");
    }

    #[test]
    fn orphan_connection_detected() {
        let mut state = consistent();
        state.connections.push(connection(3, room(1)));
        assert!(MemberIndexConsistent.check(&state).is_err());
    }

    #[test]
    fn unknown_member_detected() {
        let mut state = consistent();
        state.rooms[0].members.push(ConnectionId(99));
        assert!(MemberIndexConsistent.check(&state).is_err());
    }

    #[test]
    fn unsubscribed_room_detected() {
        let mut state = consistent();
        state.rooms[1].subscribed = false;
        assert!(SubscriptionPerRoom.check(&state).is_err());
    }

    #[test]
    fn idle_room_detected() {
        let mut state = consistent();
        state.rooms[1].reserved = false;
        assert!(NoIdleRooms.check(&state).is_err());

        let violations = InvariantRegistry::standard().check_all(&state).unwrap_err();
        assert_eq!(violations.len(), 1);
    }
}
