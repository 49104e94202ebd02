//! Wire protocol and connection layer shared by the arena server and client.
//!
//! The crate is organised bottom-up:
//!
//! - [`codec`], [`message`]: byte primitives and the closed message set
//! - [`sequence`], [`reliable`]: staleness rejection and reliable ordering
//! - [`packet`], [`connection`]: datagram packing and per-peer sessions
//! - [`transport`]: UDP and in-memory datagram transports
//! - [`discovery`]: multicast LAN advertisements

pub mod codec;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod message;
pub mod packet;
pub mod reliable;
pub mod sequence;
pub mod transport;
pub mod types;

pub use config::{ConnectionConfig, DiscoveryConfig};
pub use connection::{Connection, ConnectionStats, MessageHandler};
pub use error::{ConnectionError, MalformedMessage, UnsupportedMessage};
pub use message::{LeaveReason, Message, MessageKind, RejectReason};
pub use sequence::{ChannelKey, ChannelSubject, Reliability, SequenceChannels, SequenceCounters};
pub use transport::{MemoryEndpoint, MemoryNetwork, Transport};
pub use types::{EntityId, EntityKind, EntityState, PlayerId, Vec2};

/// Bumped whenever the wire format changes incompatibly.
pub const PROTOCOL_REVISION: u8 = 1;
/// First four bytes of every discovery advertisement ("ARNA").
pub const APP_IDENTIFIER: u32 = 0x4152_4E41;
pub const DEFAULT_PORT: u16 = 27960;

/// Player and server names, in bytes.
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_CHAT_LEN: usize = 256;

pub const WORLD_WIDTH: f32 = 1600.0;
pub const WORLD_HEIGHT: f32 = 900.0;
pub const AVATAR_RADIUS: f32 = 18.0;
pub const AVATAR_SPEED: f32 = 260.0;
pub const ORB_RADIUS: f32 = 6.0;
pub const ORB_ORBIT_RADIUS: f32 = 34.0;

/// Keeps a circle of `radius` inside the arena.
pub fn clamp_to_world(position: Vec2, radius: f32) -> Vec2 {
    Vec2::new(
        position.x.clamp(radius, WORLD_WIDTH - radius),
        position.y.clamp(radius, WORLD_HEIGHT - radius),
    )
}
