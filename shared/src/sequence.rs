//! Reliability classification and per-channel staleness rejection.
//!
//! Every unreliable message belongs to a channel keyed by `(kind, subject)`.
//! Each channel is an independent monotonic stream, so a lost or late update
//! for one entity never holds back updates for another.

use crate::message::MessageKind;
use crate::types::{EntityId, PlayerId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Delivered at least once, released to the handler exactly once and in
    /// send order.
    Reliable,
    /// Sent once; dropped on arrival if a newer update on the same channel
    /// was already applied.
    UnreliableSequenced,
}

/// Static reliability class of a message kind. Never present on the wire.
pub fn classify(kind: MessageKind) -> Reliability {
    match kind {
        MessageKind::ClientConnect
        | MessageKind::ConnectAccept
        | MessageKind::ConnectReject
        | MessageKind::PlayerJoin
        | MessageKind::PlayerLeave
        | MessageKind::Chat
        | MessageKind::EntityAdd
        | MessageKind::EntityRemove
        | MessageKind::Kill
        | MessageKind::PlayerStats
        | MessageKind::ClientSynced
        | MessageKind::ClientLeave
        | MessageKind::ServerQuit => Reliability::Reliable,

        MessageKind::TransformUpdate
        | MessageKind::CircleUpdate
        | MessageKind::OrbUpdate
        | MessageKind::LightningUpdate
        | MessageKind::EntityCollision
        | MessageKind::PlayerInput => Reliability::UnreliableSequenced,
    }
}

/// Signed distance from `last` to `incoming` in the `u32` ring.
///
/// # Examples
/// ```
/// # use arena_shared::sequence::sequence_diff;
/// assert_eq!(sequence_diff(12, 10), 2);
/// assert_eq!(sequence_diff(10, 12), -2);
/// assert_eq!(sequence_diff(2, u32::MAX - 1), 4);
/// ```
pub fn sequence_diff(incoming: u32, last: u32) -> i32 {
    incoming.wrapping_sub(last) as i32
}

/// Returns whether `s1` is strictly newer than `s2` under wraparound.
/// sequence_greater_than(2, 1) is true, sequence_greater_than(1, 1) is false.
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    sequence_diff(s1, s2) > 0
}

pub fn sequence_less_than(s1: u32, s2: u32) -> bool {
    sequence_greater_than(s2, s1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelSubject {
    Entity(EntityId),
    Player(PlayerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub kind: MessageKind,
    pub subject: ChannelSubject,
}

impl ChannelKey {
    pub fn new(kind: MessageKind, subject: ChannelSubject) -> Self {
        Self { kind, subject }
    }

    pub fn entity(kind: MessageKind, entity: EntityId) -> Self {
        Self::new(kind, ChannelSubject::Entity(entity))
    }

    pub fn player(kind: MessageKind, player: PlayerId) -> Self {
        Self::new(kind, ChannelSubject::Player(player))
    }
}

/// Receive side: last applied sequence per channel.
///
/// Channels appear lazily on the first update for a subject and disappear
/// with [`SequenceChannels::remove_subject`].
#[derive(Debug, Default)]
pub struct SequenceChannels {
    last_applied: HashMap<ChannelKey, u32>,
}

impl SequenceChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `sequence` is strictly newer than the channel's last applied
    /// sequence, or the channel has never been seen.
    pub fn should_apply(&self, key: &ChannelKey, sequence: u32) -> bool {
        match self.last_applied.get(key) {
            Some(&last) => sequence_greater_than(sequence, last),
            None => true,
        }
    }

    /// Commits acceptance of `sequence`. Callers check `should_apply` first.
    pub fn advance(&mut self, key: ChannelKey, sequence: u32) {
        self.last_applied.insert(key, sequence);
    }

    /// `should_apply` followed by `advance` when it passes.
    pub fn accept(&mut self, key: ChannelKey, sequence: u32) -> bool {
        if self.should_apply(&key, sequence) {
            self.advance(key, sequence);
            true
        } else {
            false
        }
    }

    pub fn last_applied(&self, key: &ChannelKey) -> Option<u32> {
        self.last_applied.get(key).copied()
    }

    pub fn remove_subject(&mut self, subject: ChannelSubject) {
        self.last_applied.retain(|key, _| key.subject != subject);
    }

    pub fn clear(&mut self) {
        self.last_applied.clear();
    }

    pub fn len(&self) -> usize {
        self.last_applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_applied.is_empty()
    }
}

/// Send side: next sequence to stamp per channel.
#[derive(Debug, Default)]
pub struct SequenceCounters {
    next: HashMap<ChannelKey, u32>,
}

impl SequenceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, key: ChannelKey) -> u32 {
        let counter = self.next.entry(key).or_insert(0);
        let sequence = *counter;
        *counter = counter.wrapping_add(1);
        sequence
    }

    pub fn remove_subject(&mut self, subject: ChannelSubject) {
        self.next.retain(|key, _| key.subject != subject);
    }

    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }
}
