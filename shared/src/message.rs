//! The closed set of wire messages and their framing.
//!
//! Every message is framed as
//!
//! ```text
//! [tag: u8][sequence: u32 LE, unreliable kinds only][payload_length: varint][payload]
//! ```
//!
//! Payloads are bincode-encoded payload structs. Whether a kind carries a
//! sequence number is a static property of its tag (see
//! [`classify`](crate::sequence::classify)); nothing on the wire says so.

use crate::codec::{put_u32_le, put_u8, put_varint, WireReader};
use crate::error::MalformedMessage;
use crate::sequence::{classify, ChannelKey, ChannelSubject, Reliability};
use crate::types::{EntityId, EntityKind, EntityState, PlayerId, Vec2};
use crate::{MAX_CHAT_LEN, MAX_NAME_LEN};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Wire tag of every message variant. Values are stable across releases and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageKind {
    ClientConnect = 1,
    ConnectAccept = 2,
    ConnectReject = 3,
    PlayerJoin = 4,
    PlayerLeave = 5,
    Chat = 6,
    EntityAdd = 7,
    EntityRemove = 8,
    Kill = 9,
    PlayerStats = 10,
    ClientSynced = 11,
    ClientLeave = 12,
    ServerQuit = 13,

    TransformUpdate = 32,
    CircleUpdate = 33,
    OrbUpdate = 34,
    LightningUpdate = 35,
    EntityCollision = 36,

    PlayerInput = 48,
}

impl MessageKind {
    pub const ALL: [MessageKind; 19] = [
        MessageKind::ClientConnect,
        MessageKind::ConnectAccept,
        MessageKind::ConnectReject,
        MessageKind::PlayerJoin,
        MessageKind::PlayerLeave,
        MessageKind::Chat,
        MessageKind::EntityAdd,
        MessageKind::EntityRemove,
        MessageKind::Kill,
        MessageKind::PlayerStats,
        MessageKind::ClientSynced,
        MessageKind::ClientLeave,
        MessageKind::ServerQuit,
        MessageKind::TransformUpdate,
        MessageKind::CircleUpdate,
        MessageKind::OrbUpdate,
        MessageKind::LightningUpdate,
        MessageKind::EntityCollision,
        MessageKind::PlayerInput,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<MessageKind> {
        let kind = match tag {
            1 => MessageKind::ClientConnect,
            2 => MessageKind::ConnectAccept,
            3 => MessageKind::ConnectReject,
            4 => MessageKind::PlayerJoin,
            5 => MessageKind::PlayerLeave,
            6 => MessageKind::Chat,
            7 => MessageKind::EntityAdd,
            8 => MessageKind::EntityRemove,
            9 => MessageKind::Kill,
            10 => MessageKind::PlayerStats,
            11 => MessageKind::ClientSynced,
            12 => MessageKind::ClientLeave,
            13 => MessageKind::ServerQuit,
            32 => MessageKind::TransformUpdate,
            33 => MessageKind::CircleUpdate,
            34 => MessageKind::OrbUpdate,
            35 => MessageKind::LightningUpdate,
            36 => MessageKind::EntityCollision,
            48 => MessageKind::PlayerInput,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    ProtocolMismatch { server_revision: u8 },
    ServerFull { capacity: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    Left,
    TimedOut,
    Kicked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConnect {
    pub protocol_revision: u8,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectAccept {
    pub player: PlayerId,
    pub tick_rate: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerJoin {
    pub player: PlayerId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLeave {
    pub player: PlayerId,
    pub reason: LeaveReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    /// Overwritten by the server with the sending session's id.
    pub player: PlayerId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAdd {
    pub entity: EntityId,
    pub kind: EntityKind,
    pub owner: Option<PlayerId>,
    pub state: EntityState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kill {
    pub killer: PlayerId,
    pub victim: PlayerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub player: PlayerId,
    pub kills: u32,
    pub deaths: u32,
    pub score: i32,
}

// Unreliable payloads. `sequence` travels in the frame header, not the
// payload, so it is skipped by serde and restored by `decode`.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformUpdate {
    #[serde(skip)]
    pub sequence: u32,
    pub entity: EntityId,
    pub position: Vec2,
    pub rotation: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleUpdate {
    #[serde(skip)]
    pub sequence: u32,
    pub entity: EntityId,
    pub velocity: Vec2,
    pub radius: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbUpdate {
    #[serde(skip)]
    pub sequence: u32,
    pub entity: EntityId,
    pub charge: f32,
    pub orbit_angle: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightningUpdate {
    #[serde(skip)]
    pub sequence: u32,
    pub entity: EntityId,
    pub origin: Vec2,
    pub target: Vec2,
    pub intensity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCollision {
    #[serde(skip)]
    pub sequence: u32,
    pub entity: EntityId,
    pub other: EntityId,
    pub impulse: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInput {
    #[serde(skip)]
    pub sequence: u32,
    pub player: PlayerId,
    pub move_dir: Vec2,
    pub aim: f32,
    pub fire: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ClientConnect(ClientConnect),
    ConnectAccept(ConnectAccept),
    ConnectReject(RejectReason),
    PlayerJoin(PlayerJoin),
    PlayerLeave(PlayerLeave),
    Chat(Chat),
    EntityAdd(EntityAdd),
    EntityRemove(EntityId),
    Kill(Kill),
    PlayerStats(PlayerStats),
    ClientSynced,
    ClientLeave,
    ServerQuit,

    TransformUpdate(TransformUpdate),
    CircleUpdate(CircleUpdate),
    OrbUpdate(OrbUpdate),
    LightningUpdate(LightningUpdate),
    EntityCollision(EntityCollision),
    PlayerInput(PlayerInput),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ClientConnect(_) => MessageKind::ClientConnect,
            Message::ConnectAccept(_) => MessageKind::ConnectAccept,
            Message::ConnectReject(_) => MessageKind::ConnectReject,
            Message::PlayerJoin(_) => MessageKind::PlayerJoin,
            Message::PlayerLeave(_) => MessageKind::PlayerLeave,
            Message::Chat(_) => MessageKind::Chat,
            Message::EntityAdd(_) => MessageKind::EntityAdd,
            Message::EntityRemove(_) => MessageKind::EntityRemove,
            Message::Kill(_) => MessageKind::Kill,
            Message::PlayerStats(_) => MessageKind::PlayerStats,
            Message::ClientSynced => MessageKind::ClientSynced,
            Message::ClientLeave => MessageKind::ClientLeave,
            Message::ServerQuit => MessageKind::ServerQuit,
            Message::TransformUpdate(_) => MessageKind::TransformUpdate,
            Message::CircleUpdate(_) => MessageKind::CircleUpdate,
            Message::OrbUpdate(_) => MessageKind::OrbUpdate,
            Message::LightningUpdate(_) => MessageKind::LightningUpdate,
            Message::EntityCollision(_) => MessageKind::EntityCollision,
            Message::PlayerInput(_) => MessageKind::PlayerInput,
        }
    }

    pub fn reliability(&self) -> Reliability {
        classify(self.kind())
    }

    /// Sequence number of an unreliable message; `None` for reliable kinds.
    pub fn sequence(&self) -> Option<u32> {
        match self {
            Message::TransformUpdate(m) => Some(m.sequence),
            Message::CircleUpdate(m) => Some(m.sequence),
            Message::OrbUpdate(m) => Some(m.sequence),
            Message::LightningUpdate(m) => Some(m.sequence),
            Message::EntityCollision(m) => Some(m.sequence),
            Message::PlayerInput(m) => Some(m.sequence),
            _ => None,
        }
    }

    fn set_sequence(&mut self, sequence: u32) {
        match self {
            Message::TransformUpdate(m) => m.sequence = sequence,
            Message::CircleUpdate(m) => m.sequence = sequence,
            Message::OrbUpdate(m) => m.sequence = sequence,
            Message::LightningUpdate(m) => m.sequence = sequence,
            Message::EntityCollision(m) => m.sequence = sequence,
            Message::PlayerInput(m) => m.sequence = sequence,
            _ => {}
        }
    }

    /// The sequence channel an unreliable message belongs to.
    pub fn channel_key(&self) -> Option<ChannelKey> {
        let subject = match self {
            Message::TransformUpdate(m) => ChannelSubject::Entity(m.entity),
            Message::CircleUpdate(m) => ChannelSubject::Entity(m.entity),
            Message::OrbUpdate(m) => ChannelSubject::Entity(m.entity),
            Message::LightningUpdate(m) => ChannelSubject::Entity(m.entity),
            Message::EntityCollision(m) => ChannelSubject::Entity(m.entity),
            Message::PlayerInput(m) => ChannelSubject::Player(m.player),
            _ => return None,
        };
        Some(ChannelKey::new(self.kind(), subject))
    }

    /// Subject whose sequence channels end once this message is applied.
    pub fn retired_subject(&self) -> Option<ChannelSubject> {
        match self {
            Message::EntityRemove(entity) => Some(ChannelSubject::Entity(*entity)),
            Message::PlayerLeave(leave) => Some(ChannelSubject::Player(leave.player)),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        let mut out = Vec::new();
        encode(self, &mut out)?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message, MalformedMessage> {
        decode(&mut WireReader::new(bytes))
    }
}

/// Appends one framed message to `out`.
pub fn encode(message: &Message, out: &mut Vec<u8>) -> Result<(), bincode::Error> {
    let mut payload = Vec::new();
    match message {
        Message::ClientConnect(m) => bincode::serialize_into(&mut payload, m)?,
        Message::ConnectAccept(m) => bincode::serialize_into(&mut payload, m)?,
        Message::ConnectReject(m) => bincode::serialize_into(&mut payload, m)?,
        Message::PlayerJoin(m) => bincode::serialize_into(&mut payload, m)?,
        Message::PlayerLeave(m) => bincode::serialize_into(&mut payload, m)?,
        Message::Chat(m) => bincode::serialize_into(&mut payload, m)?,
        Message::EntityAdd(m) => bincode::serialize_into(&mut payload, m)?,
        Message::EntityRemove(m) => bincode::serialize_into(&mut payload, m)?,
        Message::Kill(m) => bincode::serialize_into(&mut payload, m)?,
        Message::PlayerStats(m) => bincode::serialize_into(&mut payload, m)?,
        Message::ClientSynced | Message::ClientLeave | Message::ServerQuit => {}
        Message::TransformUpdate(m) => bincode::serialize_into(&mut payload, m)?,
        Message::CircleUpdate(m) => bincode::serialize_into(&mut payload, m)?,
        Message::OrbUpdate(m) => bincode::serialize_into(&mut payload, m)?,
        Message::LightningUpdate(m) => bincode::serialize_into(&mut payload, m)?,
        Message::EntityCollision(m) => bincode::serialize_into(&mut payload, m)?,
        Message::PlayerInput(m) => bincode::serialize_into(&mut payload, m)?,
    }

    put_u8(out, message.kind().tag());
    if let Some(sequence) = message.sequence() {
        put_u32_le(out, sequence);
    }
    put_varint(out, payload.len() as u32);
    out.extend_from_slice(&payload);
    Ok(())
}

/// Reads one framed message. On error the reader position is unspecified and
/// the rest of the buffer should be discarded.
pub fn decode(reader: &mut WireReader<'_>) -> Result<Message, MalformedMessage> {
    let tag = reader.read_u8("tag")?;
    let kind = MessageKind::from_tag(tag).ok_or(MalformedMessage::UnknownTag { tag })?;

    let sequence = match classify(kind) {
        Reliability::UnreliableSequenced => Some(reader.read_u32_le("sequence")?),
        Reliability::Reliable => None,
    };

    let declared = reader.read_varint("payload length")? as usize;
    if declared > reader.remaining() {
        return Err(MalformedMessage::LengthOverrun {
            declared,
            remaining: reader.remaining(),
        });
    }
    let payload = reader.read_bytes(declared, "payload")?;

    let mut message = match kind {
        MessageKind::ClientConnect => {
            let m: ClientConnect = payload_of(kind, payload)?;
            check_len("player name", &m.name, MAX_NAME_LEN)?;
            Message::ClientConnect(m)
        }
        MessageKind::ConnectAccept => Message::ConnectAccept(payload_of(kind, payload)?),
        MessageKind::ConnectReject => Message::ConnectReject(payload_of(kind, payload)?),
        MessageKind::PlayerJoin => {
            let m: PlayerJoin = payload_of(kind, payload)?;
            check_len("player name", &m.name, MAX_NAME_LEN)?;
            Message::PlayerJoin(m)
        }
        MessageKind::PlayerLeave => Message::PlayerLeave(payload_of(kind, payload)?),
        MessageKind::Chat => {
            let m: Chat = payload_of(kind, payload)?;
            check_len("chat text", &m.text, MAX_CHAT_LEN)?;
            Message::Chat(m)
        }
        MessageKind::EntityAdd => Message::EntityAdd(payload_of(kind, payload)?),
        MessageKind::EntityRemove => Message::EntityRemove(payload_of(kind, payload)?),
        MessageKind::Kill => Message::Kill(payload_of(kind, payload)?),
        MessageKind::PlayerStats => Message::PlayerStats(payload_of(kind, payload)?),
        MessageKind::ClientSynced => Message::ClientSynced,
        MessageKind::ClientLeave => Message::ClientLeave,
        MessageKind::ServerQuit => Message::ServerQuit,
        MessageKind::TransformUpdate => Message::TransformUpdate(payload_of(kind, payload)?),
        MessageKind::CircleUpdate => Message::CircleUpdate(payload_of(kind, payload)?),
        MessageKind::OrbUpdate => Message::OrbUpdate(payload_of(kind, payload)?),
        MessageKind::LightningUpdate => Message::LightningUpdate(payload_of(kind, payload)?),
        MessageKind::EntityCollision => Message::EntityCollision(payload_of(kind, payload)?),
        MessageKind::PlayerInput => Message::PlayerInput(payload_of(kind, payload)?),
    };

    if let Some(sequence) = sequence {
        message.set_sequence(sequence);
    }
    Ok(message)
}

fn payload_of<T: DeserializeOwned>(kind: MessageKind, payload: &[u8]) -> Result<T, MalformedMessage> {
    bincode::deserialize(payload).map_err(|_| MalformedMessage::BadPayload { kind })
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), MalformedMessage> {
    if value.len() > max {
        return Err(MalformedMessage::FieldTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> EntityState {
        EntityState {
            position: Vec2::new(120.0, -40.5),
            rotation: 1.25,
            velocity: Vec2::new(3.0, 4.0),
            radius: 16.0,
            ..EntityState::default()
        }
    }

    /// One instance of every variant, with non-default field values.
    fn every_variant() -> Vec<Message> {
        vec![
            Message::ClientConnect(ClientConnect {
                protocol_revision: 3,
                name: "Ada".to_string(),
            }),
            Message::ConnectAccept(ConnectAccept {
                player: PlayerId(4),
                tick_rate: 30,
            }),
            Message::ConnectReject(RejectReason::ProtocolMismatch { server_revision: 9 }),
            Message::ConnectReject(RejectReason::ServerFull { capacity: 8 }),
            Message::PlayerJoin(PlayerJoin {
                player: PlayerId(2),
                name: "Grace".to_string(),
            }),
            Message::PlayerLeave(PlayerLeave {
                player: PlayerId(2),
                reason: LeaveReason::TimedOut,
            }),
            Message::Chat(Chat {
                player: PlayerId(1),
                text: "gg".to_string(),
            }),
            Message::EntityAdd(EntityAdd {
                entity: EntityId(17),
                kind: EntityKind::Avatar,
                owner: Some(PlayerId(2)),
                state: state(),
            }),
            Message::EntityRemove(EntityId(17)),
            Message::Kill(Kill {
                killer: PlayerId(1),
                victim: PlayerId(2),
            }),
            Message::PlayerStats(PlayerStats {
                player: PlayerId(1),
                kills: 3,
                deaths: 1,
                score: -2,
            }),
            Message::ClientSynced,
            Message::ClientLeave,
            Message::ServerQuit,
            Message::TransformUpdate(TransformUpdate {
                sequence: 77,
                entity: EntityId(5),
                position: Vec2::new(1.0, 2.0),
                rotation: 0.5,
            }),
            Message::CircleUpdate(CircleUpdate {
                sequence: u32::MAX,
                entity: EntityId(5),
                velocity: Vec2::new(-1.0, 0.0),
                radius: 12.0,
            }),
            Message::OrbUpdate(OrbUpdate {
                sequence: 0,
                entity: EntityId(6),
                charge: 0.75,
                orbit_angle: 3.0,
            }),
            Message::LightningUpdate(LightningUpdate {
                sequence: 9,
                entity: EntityId(8),
                origin: Vec2::new(0.0, 0.0),
                target: Vec2::new(100.0, 50.0),
                intensity: 1.0,
            }),
            Message::EntityCollision(EntityCollision {
                sequence: 10,
                entity: EntityId(5),
                other: EntityId(9),
                impulse: 42.0,
            }),
            Message::PlayerInput(PlayerInput {
                sequence: 1234,
                player: PlayerId(3),
                move_dir: Vec2::new(0.0, 1.0),
                aim: -1.5,
                fire: true,
            }),
        ]
    }

    #[test]
    fn test_every_variant_round_trips() {
        let messages = every_variant();
        let covered: std::collections::HashSet<MessageKind> =
            messages.iter().map(Message::kind).collect();
        assert_eq!(covered.len(), MessageKind::ALL.len());

        for message in messages {
            let bytes = message.to_bytes().unwrap();
            let decoded = Message::from_bytes(&bytes).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_tags_round_trip_and_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for kind in MessageKind::ALL {
            assert!(seen.insert(kind.tag()), "duplicate tag {}", kind.tag());
            assert_eq!(MessageKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(MessageKind::from_tag(0), None);
        assert_eq!(MessageKind::from_tag(200), None);
    }

    #[test]
    fn test_empty_and_maximum_length_names() {
        for name in [String::new(), "n".repeat(MAX_NAME_LEN)] {
            let message = Message::ClientConnect(ClientConnect {
                protocol_revision: 1,
                name,
            });
            let bytes = message.to_bytes().unwrap();
            assert_eq!(Message::from_bytes(&bytes).unwrap(), message);
        }

        let chat = Message::Chat(Chat {
            player: PlayerId(1),
            text: "x".repeat(MAX_CHAT_LEN),
        });
        assert_eq!(Message::from_bytes(&chat.to_bytes().unwrap()).unwrap(), chat);
    }

    #[test]
    fn test_overlong_name_is_malformed() {
        let message = Message::PlayerJoin(PlayerJoin {
            player: PlayerId(1),
            name: "n".repeat(MAX_NAME_LEN + 1),
        });
        let bytes = message.to_bytes().unwrap();
        assert_eq!(
            Message::from_bytes(&bytes),
            Err(MalformedMessage::FieldTooLong {
                field: "player name",
                len: MAX_NAME_LEN + 1,
                max: MAX_NAME_LEN,
            })
        );
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        assert_eq!(
            Message::from_bytes(&[0xee, 0x00]),
            Err(MalformedMessage::UnknownTag { tag: 0xee })
        );
    }

    #[test]
    fn test_declared_length_past_buffer_is_malformed() {
        let mut bytes = Message::Kill(Kill {
            killer: PlayerId(1),
            victim: PlayerId(2),
        })
        .to_bytes()
        .unwrap();
        // Kill payload is 8 bytes; claim 100.
        bytes[1] = 100;
        assert_eq!(
            Message::from_bytes(&bytes),
            Err(MalformedMessage::LengthOverrun {
                declared: 100,
                remaining: 8,
            })
        );
    }

    #[test]
    fn test_truncated_sequence_is_malformed() {
        let bytes = [MessageKind::TransformUpdate.tag(), 0x01, 0x02];
        assert_eq!(
            Message::from_bytes(&bytes),
            Err(MalformedMessage::Truncated { field: "sequence" })
        );
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        // EntityAdd with a 2-byte payload cannot hold an EntityId plus state.
        let bytes = [MessageKind::EntityAdd.tag(), 2, 0xff, 0xff];
        assert_eq!(
            Message::from_bytes(&bytes),
            Err(MalformedMessage::BadPayload {
                kind: MessageKind::EntityAdd
            })
        );
    }

    #[test]
    fn test_sequence_travels_outside_payload() {
        let message = Message::OrbUpdate(OrbUpdate {
            sequence: 0x0102_0304,
            entity: EntityId(1),
            charge: 0.0,
            orbit_angle: 0.0,
        });
        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes[0], MessageKind::OrbUpdate.tag());
        assert_eq!(&bytes[1..5], &[0x04, 0x03, 0x02, 0x01]);
        // entity (4) + charge (4) + angle (4)
        assert_eq!(bytes[5], 12);
        assert_eq!(bytes.len(), 6 + 12);
    }

    #[test]
    fn test_channel_keys_separate_kinds_and_subjects() {
        let transform = Message::TransformUpdate(TransformUpdate {
            sequence: 1,
            entity: EntityId(5),
            position: Vec2::ZERO,
            rotation: 0.0,
        });
        let circle = Message::CircleUpdate(CircleUpdate {
            sequence: 1,
            entity: EntityId(5),
            velocity: Vec2::ZERO,
            radius: 1.0,
        });
        assert_ne!(transform.channel_key(), circle.channel_key());
        assert_eq!(
            transform.channel_key(),
            Some(ChannelKey::new(
                MessageKind::TransformUpdate,
                ChannelSubject::Entity(EntityId(5))
            ))
        );
        assert_eq!(Message::ClientSynced.channel_key(), None);
        assert_eq!(
            Message::EntityRemove(EntityId(5)).retired_subject(),
            Some(ChannelSubject::Entity(EntityId(5)))
        );
    }
}
