//! The client's mirror of the server world.
//!
//! The mirror only changes through messages from the server. Between updates
//! it extrapolates avatars along their last known velocity so a lost update
//! does not freeze them in place.

use arena_shared::message::{EntityAdd, Kill, PlayerStats};
use arena_shared::{
    clamp_to_world, EntityId, EntityKind, EntityState, Message, PlayerId, Vec2, ORB_ORBIT_RADIUS,
};
use log::{debug, trace};
use std::collections::{BTreeMap, VecDeque};

/// Chat lines and kills kept for display.
const FEED_LEN: usize = 32;
/// Entities with updates waiting for their `EntityAdd`.
const MAX_PARKED: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct MirroredEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub owner: Option<PlayerId>,
    pub state: EntityState,
}

impl From<&EntityAdd> for MirroredEntity {
    fn from(add: &EntityAdd) -> Self {
        Self {
            id: add.entity,
            kind: add.kind,
            owner: add.owner,
            state: add.state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerInfo {
    pub name: String,
    pub kills: u32,
    pub deaths: u32,
    pub score: i32,
}

#[derive(Debug, Default)]
pub struct ClientWorld {
    players: BTreeMap<PlayerId, PlayerInfo>,
    entities: BTreeMap<EntityId, MirroredEntity>,
    chat: VecDeque<(PlayerId, String)>,
    kills: VecDeque<Kill>,
    collisions: u64,
    /// Latest update per kind for entities not added yet. The connection has
    /// already advanced those channels, so a dropped update would only be
    /// repaired by the next full refresh.
    parked: BTreeMap<EntityId, Vec<Message>>,
}

impl ClientWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything, as before a fresh join.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Applies one world message. Returns false for messages that do not
    /// touch the world and for updates about entities not in the mirror;
    /// state updates for those are held until the entity's add arrives.
    pub fn apply(&mut self, message: &Message) -> bool {
        if let Some(id) = updated_entity(message) {
            if !self.entities.contains_key(&id) {
                self.park(id, message);
                return false;
            }
        }

        match message {
            Message::PlayerJoin(join) => {
                self.players.entry(join.player).or_default().name = join.name.clone();
            }
            Message::PlayerLeave(leave) => {
                return self.players.remove(&leave.player).is_some();
            }
            Message::PlayerStats(stats) => self.apply_stats(stats),
            Message::Chat(chat) => {
                push_bounded(&mut self.chat, (chat.player, chat.text.clone()));
            }
            Message::Kill(kill) => {
                push_bounded(&mut self.kills, kill.clone());
            }
            Message::EntityAdd(add) => {
                self.entities.insert(add.entity, MirroredEntity::from(add));
                for update in self.parked.remove(&add.entity).unwrap_or_default() {
                    self.apply(&update);
                }
            }
            Message::EntityRemove(entity) => {
                self.parked.remove(entity);
                return self.entities.remove(entity).is_some();
            }

            Message::TransformUpdate(update) => {
                return self.update_entity(update.entity, |state| {
                    state.position = update.position;
                    state.rotation = update.rotation;
                });
            }
            Message::CircleUpdate(update) => {
                return self.update_entity(update.entity, |state| {
                    state.velocity = update.velocity;
                    state.radius = update.radius;
                });
            }
            Message::OrbUpdate(update) => {
                return self.update_entity(update.entity, |state| {
                    state.charge = update.charge;
                    state.orbit_angle = update.orbit_angle;
                });
            }
            Message::LightningUpdate(update) => {
                return self.update_entity(update.entity, |state| {
                    state.position = update.origin;
                    state.target = update.target;
                    state.intensity = update.intensity;
                });
            }
            Message::EntityCollision(collision) => {
                if !self.entities.contains_key(&collision.entity) {
                    return false;
                }
                self.collisions += 1;
            }

            Message::ClientConnect(_)
            | Message::ConnectAccept(_)
            | Message::ConnectReject(_)
            | Message::ClientSynced
            | Message::ClientLeave
            | Message::ServerQuit
            | Message::PlayerInput(_) => return false,
        }
        true
    }

    fn park(&mut self, id: EntityId, message: &Message) {
        if !self.parked.contains_key(&id) && self.parked.len() == MAX_PARKED {
            self.parked.pop_first();
        }
        let updates = self.parked.entry(id).or_default();
        updates.retain(|parked| parked.kind() != message.kind());
        updates.push(message.clone());
        debug!("parked {:?} for unknown {}", message.kind(), id);
    }

    fn apply_stats(&mut self, stats: &PlayerStats) {
        let info = self.players.entry(stats.player).or_default();
        info.kills = stats.kills;
        info.deaths = stats.deaths;
        info.score = stats.score;
    }

    fn update_entity(&mut self, id: EntityId, update: impl FnOnce(&mut EntityState)) -> bool {
        match self.entities.get_mut(&id) {
            Some(entity) => {
                update(&mut entity.state);
                true
            }
            None => false,
        }
    }

    /// Moves avatars along their velocity and keeps orbs on their owner's
    /// avatar.
    pub fn extrapolate(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }

        let mut avatars: BTreeMap<PlayerId, Vec2> = BTreeMap::new();
        for entity in self.entities.values_mut() {
            if entity.kind != EntityKind::Avatar {
                continue;
            }
            let state = &mut entity.state;
            state.position = clamp_to_world(state.position + state.velocity * dt, state.radius);
            if let Some(owner) = entity.owner {
                avatars.insert(owner, state.position);
            }
        }

        for entity in self.entities.values_mut() {
            if entity.kind != EntityKind::Orb {
                continue;
            }
            if let Some(center) = entity.owner.and_then(|owner| avatars.get(&owner)) {
                entity.state.position =
                    *center + Vec2::from_angle(entity.state.orbit_angle) * ORB_ORBIT_RADIUS;
            }
        }
        trace!("extrapolated {} avatars by {:.3}s", avatars.len(), dt);
    }

    pub fn player(&self, id: PlayerId) -> Option<&PlayerInfo> {
        self.players.get(&id)
    }

    pub fn players(&self) -> impl Iterator<Item = (&PlayerId, &PlayerInfo)> {
        self.players.iter()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn entity(&self, id: EntityId) -> Option<&MirroredEntity> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &MirroredEntity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// The avatar owned by `player`, if it has spawned.
    pub fn avatar_of(&self, player: PlayerId) -> Option<&MirroredEntity> {
        self.entities
            .values()
            .find(|e| e.kind == EntityKind::Avatar && e.owner == Some(player))
    }

    pub fn chat_log(&self) -> impl Iterator<Item = &(PlayerId, String)> {
        self.chat.iter()
    }

    pub fn kill_feed(&self) -> impl Iterator<Item = &Kill> {
        self.kills.iter()
    }

    pub fn collisions_seen(&self) -> u64 {
        self.collisions
    }
}

/// The entity a state update targets. Collisions are events, not state, and
/// are never parked.
fn updated_entity(message: &Message) -> Option<EntityId> {
    match message {
        Message::TransformUpdate(update) => Some(update.entity),
        Message::CircleUpdate(update) => Some(update.entity),
        Message::OrbUpdate(update) => Some(update.entity),
        Message::LightningUpdate(update) => Some(update.entity),
        _ => None,
    }
}

fn push_bounded<T>(feed: &mut VecDeque<T>, item: T) {
    if feed.len() == FEED_LEN {
        feed.pop_front();
    }
    feed.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_shared::message::{Chat, CircleUpdate, PlayerJoin, PlayerLeave, TransformUpdate};
    use arena_shared::LeaveReason;
    use assert_approx_eq::assert_approx_eq;

    fn avatar(id: u32, owner: u32, position: Vec2) -> Message {
        Message::EntityAdd(EntityAdd {
            entity: EntityId(id),
            kind: EntityKind::Avatar,
            owner: Some(PlayerId(owner)),
            state: EntityState {
                position,
                radius: 18.0,
                ..EntityState::default()
            },
        })
    }

    #[test]
    fn test_players_join_and_leave() {
        let mut world = ClientWorld::new();
        assert!(world.apply(&Message::PlayerJoin(PlayerJoin {
            player: PlayerId(1),
            name: "alice".to_string(),
        })));
        assert_eq!(world.player(PlayerId(1)).unwrap().name, "alice");

        assert!(world.apply(&Message::PlayerLeave(PlayerLeave {
            player: PlayerId(1),
            reason: LeaveReason::Left,
        })));
        assert_eq!(world.player_count(), 0);
    }

    #[test]
    fn test_updates_for_unknown_entities_are_not_applied() {
        let mut world = ClientWorld::new();
        let update = Message::TransformUpdate(TransformUpdate {
            sequence: 1,
            entity: EntityId(9),
            position: Vec2::new(5.0, 5.0),
            rotation: 0.0,
        });
        assert!(!world.apply(&update));
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn test_update_before_add_is_applied_on_add() {
        let mut world = ClientWorld::new();
        let early = |sequence: u32, x: f32| {
            Message::TransformUpdate(TransformUpdate {
                sequence,
                entity: EntityId(3),
                position: Vec2::new(x, 120.0),
                rotation: 0.5,
            })
        };
        assert!(!world.apply(&early(4, 200.0)));
        assert!(!world.apply(&early(5, 210.0)));
        assert_eq!(world.entity_count(), 0);

        world.apply(&avatar(3, 1, Vec2::new(100.0, 100.0)));
        let state = world.entity(EntityId(3)).unwrap().state;
        assert_approx_eq!(state.position.x, 210.0);
        assert_approx_eq!(state.position.y, 120.0);
        assert_approx_eq!(state.rotation, 0.5);
    }

    #[test]
    fn test_parked_updates_are_bounded_and_dropped_on_remove() {
        let mut world = ClientWorld::new();
        for id in 0..(MAX_PARKED as u32 + 10) {
            world.apply(&Message::TransformUpdate(TransformUpdate {
                sequence: 1,
                entity: EntityId(id),
                position: Vec2::new(1.0, 1.0),
                rotation: 0.0,
            }));
        }
        assert_eq!(world.parked.len(), MAX_PARKED);
        assert!(!world.parked.contains_key(&EntityId(0)));

        let last = EntityId(MAX_PARKED as u32 + 9);
        world.apply(&Message::EntityRemove(last));
        assert!(!world.parked.contains_key(&last));
    }

    #[test]
    fn test_transform_update_moves_entity() {
        let mut world = ClientWorld::new();
        world.apply(&avatar(3, 1, Vec2::new(100.0, 100.0)));
        world.apply(&Message::TransformUpdate(TransformUpdate {
            sequence: 4,
            entity: EntityId(3),
            position: Vec2::new(200.0, 150.0),
            rotation: 1.0,
        }));

        let state = world.entity(EntityId(3)).unwrap().state;
        assert_approx_eq!(state.position.x, 200.0);
        assert_approx_eq!(state.rotation, 1.0);
        assert_eq!(world.avatar_of(PlayerId(1)).map(|e| e.id), Some(EntityId(3)));
    }

    #[test]
    fn test_extrapolation_follows_velocity() {
        let mut world = ClientWorld::new();
        world.apply(&avatar(3, 1, Vec2::new(100.0, 100.0)));
        world.apply(&Message::CircleUpdate(CircleUpdate {
            sequence: 0,
            entity: EntityId(3),
            velocity: Vec2::new(100.0, 0.0),
            radius: 18.0,
        }));

        world.extrapolate(0.5);
        let state = world.entity(EntityId(3)).unwrap().state;
        assert_approx_eq!(state.position.x, 150.0);
        assert_approx_eq!(state.position.y, 100.0);

        world.extrapolate(0.0);
        assert_approx_eq!(world.entity(EntityId(3)).unwrap().state.position.x, 150.0);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut world = ClientWorld::new();
        world.apply(&avatar(3, 1, Vec2::new(100.0, 100.0)));
        assert!(world.apply(&Message::EntityRemove(EntityId(3))));
        assert!(!world.apply(&Message::EntityRemove(EntityId(3))));

        world.apply(&avatar(4, 1, Vec2::new(100.0, 100.0)));
        world.apply(&Message::Chat(Chat {
            player: PlayerId(1),
            text: "hi".to_string(),
        }));
        world.clear();
        assert_eq!(world.entity_count(), 0);
        assert_eq!(world.chat_log().count(), 0);
    }

    #[test]
    fn test_chat_feed_is_bounded() {
        let mut world = ClientWorld::new();
        for n in 0..FEED_LEN + 5 {
            world.apply(&Message::Chat(Chat {
                player: PlayerId(1),
                text: n.to_string(),
            }));
        }
        assert_eq!(world.chat_log().count(), FEED_LEN);
        assert_eq!(world.chat_log().next().unwrap().1, "5");
    }
}
