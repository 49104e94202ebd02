//! Authoritative arena simulation.
//!
//! Each player owns an avatar (a moving circle) and an orb that orbits it and
//! builds up charge. Firing with a full orb releases a lightning bolt along
//! the aim direction; an avatar within reach of the bolt is killed and
//! respawns elsewhere. Topology changes (spawns, removals, kills, stat
//! changes) are recorded as [`WorldEvent`]s for the network layer to send
//! reliably; continuous state is sent as per-entity deltas.

use arena_shared::message::{
    CircleUpdate, EntityAdd, LightningUpdate, OrbUpdate, PlayerInput, PlayerStats, TransformUpdate,
};
use arena_shared::{
    clamp_to_world, ChannelKey, EntityId, EntityKind, EntityState, Message, MessageKind, PlayerId,
    SequenceCounters, Vec2, AVATAR_RADIUS, AVATAR_SPEED, ORB_ORBIT_RADIUS, ORB_RADIUS,
    WORLD_HEIGHT, WORLD_WIDTH,
};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Orb revolutions per second, in radians.
const ORB_SPIN: f32 = 3.0;
/// Seconds for an empty orb to fill.
const ORB_CHARGE_TIME: f32 = 1.5;
const BOLT_RANGE: f32 = 420.0;
/// How close to the bolt's path an avatar's edge must be to be struck.
const BOLT_HIT_WIDTH: f32 = 6.0;
const BOLT_LIFETIME: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputCommand {
    pub move_dir: Vec2,
    pub aim: f32,
    pub fire: bool,
}

impl From<&PlayerInput> for InputCommand {
    fn from(input: &PlayerInput) -> Self {
        Self {
            move_dir: input.move_dir,
            aim: input.aim,
            fire: input.fire,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub owner: Option<PlayerId>,
    pub state: EntityState,
    /// Changed since the last delta broadcast.
    pub dirty: bool,
    /// Seconds left for short-lived entities.
    pub ttl: Option<f32>,
}

impl Entity {
    pub fn to_add(&self) -> EntityAdd {
        EntityAdd {
            entity: self.id,
            kind: self.kind,
            owner: self.owner,
            state: self.state,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlayerRecord {
    pub kills: u32,
    pub deaths: u32,
    pub score: i32,
    pub avatar: Option<EntityId>,
    pub orb: Option<EntityId>,
    pub input: InputCommand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    EntityAdded(EntityAdd),
    EntityRemoved(EntityId),
    Collision {
        entity: EntityId,
        other: EntityId,
        impulse: f32,
    },
    Kill {
        killer: PlayerId,
        victim: PlayerId,
    },
    StatsChanged(PlayerId),
}

pub struct GameState {
    pub tick: u32,
    entities: BTreeMap<EntityId, Entity>,
    players: BTreeMap<PlayerId, PlayerRecord>,
    next_entity_id: u32,
    events: Vec<WorldEvent>,
    rng: StdRng,
}

impl GameState {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic spawns, for tests.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            tick: 0,
            entities: BTreeMap::new(),
            players: BTreeMap::new(),
            next_entity_id: 1,
            events: Vec::new(),
            rng,
        }
    }

    pub fn add_player(&mut self, id: PlayerId) {
        self.players.entry(id).or_default();
    }

    /// Gives a player an avatar and orb. No-op if they already have one.
    pub fn spawn_avatar(&mut self, id: PlayerId) {
        let Some(record) = self.players.get(&id) else {
            return;
        };
        if record.avatar.is_some() {
            return;
        }

        let position = self.random_position();
        let avatar = self.insert_entity(
            EntityKind::Avatar,
            Some(id),
            EntityState {
                position,
                radius: AVATAR_RADIUS,
                ..EntityState::default()
            },
            None,
        );
        let orb = self.insert_entity(
            EntityKind::Orb,
            Some(id),
            EntityState {
                position: position + Vec2::new(ORB_ORBIT_RADIUS, 0.0),
                radius: ORB_RADIUS,
                ..EntityState::default()
            },
            None,
        );

        if let Some(record) = self.players.get_mut(&id) {
            record.avatar = Some(avatar);
            record.orb = Some(orb);
        }
        info!("Spawned {} for {} at ({:.0}, {:.0})", avatar, id, position.x, position.y);
    }

    /// Forgets a player and removes every entity they own.
    pub fn remove_player(&mut self, id: PlayerId) {
        if self.players.remove(&id).is_none() {
            return;
        }
        let owned: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.owner == Some(id))
            .map(|e| e.id)
            .collect();
        for entity in owned {
            self.remove_entity(entity);
        }
        info!("Removed {}", id);
    }

    pub fn apply_input(&mut self, id: PlayerId, input: InputCommand) {
        if let Some(record) = self.players.get_mut(&id) {
            record.input = input;
        }
    }

    pub fn step(&mut self, dt: f32) {
        self.tick = self.tick.wrapping_add(1);

        // Bolts fired this step live until the next one.
        self.age_bolts(dt);

        let ids: Vec<PlayerId> = self.players.keys().copied().collect();
        for id in &ids {
            self.move_avatar(*id, dt);
        }
        self.resolve_collisions();
        for id in &ids {
            self.update_orb(*id, dt);
        }
    }

    fn move_avatar(&mut self, id: PlayerId, dt: f32) {
        let Some((input, Some(avatar_id))) = self.players.get(&id).map(|r| (r.input, r.avatar)) else {
            return;
        };
        let Some(avatar) = self.entities.get_mut(&avatar_id) else {
            return;
        };

        let velocity = input.move_dir.normalized() * AVATAR_SPEED;
        let position = clamp_to_world(avatar.state.position + velocity * dt, avatar.state.radius);
        if position != avatar.state.position
            || velocity != avatar.state.velocity
            || input.aim != avatar.state.rotation
        {
            avatar.state.position = position;
            avatar.state.velocity = velocity;
            avatar.state.rotation = input.aim;
            avatar.dirty = true;
        }
    }

    /// Pushes overlapping avatars apart along the line between their centres.
    fn resolve_collisions(&mut self) {
        let avatars: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.kind == EntityKind::Avatar)
            .map(|e| e.id)
            .collect();

        for i in 0..avatars.len() {
            for j in (i + 1)..avatars.len() {
                let (a, b) = (avatars[i], avatars[j]);
                let (Some(first), Some(second)) = (self.entities.get(&a), self.entities.get(&b))
                else {
                    continue;
                };
                let delta = second.state.position - first.state.position;
                let distance = delta.length();
                let overlap = first.state.radius + second.state.radius - distance;
                if overlap <= 0.0 {
                    continue;
                }

                let normal = if distance > 0.001 {
                    delta * (1.0 / distance)
                } else {
                    Vec2::new(1.0, 0.0)
                };
                let push = normal * (overlap / 2.0);
                if let Some(first) = self.entities.get_mut(&a) {
                    first.state.position =
                        clamp_to_world(first.state.position - push, first.state.radius);
                    first.dirty = true;
                }
                if let Some(second) = self.entities.get_mut(&b) {
                    second.state.position =
                        clamp_to_world(second.state.position + push, second.state.radius);
                    second.dirty = true;
                }
                self.events.push(WorldEvent::Collision {
                    entity: a,
                    other: b,
                    impulse: overlap,
                });
            }
        }
    }

    fn update_orb(&mut self, id: PlayerId, dt: f32) {
        let Some(record) = self.players.get(&id) else {
            return;
        };
        let (Some(avatar_id), Some(orb_id)) = (record.avatar, record.orb) else {
            return;
        };
        let input = record.input;
        let Some(center) = self.entities.get(&avatar_id).map(|a| a.state.position) else {
            return;
        };

        let fired = {
            let Some(orb) = self.entities.get_mut(&orb_id) else {
                return;
            };
            orb.state.orbit_angle =
                (orb.state.orbit_angle + ORB_SPIN * dt) % std::f32::consts::TAU;
            orb.state.position = center + Vec2::from_angle(orb.state.orbit_angle) * ORB_ORBIT_RADIUS;
            orb.state.charge = (orb.state.charge + dt / ORB_CHARGE_TIME).min(1.0);
            orb.dirty = true;

            if input.fire && orb.state.charge >= 1.0 {
                orb.state.charge = 0.0;
                true
            } else {
                false
            }
        };

        if fired {
            self.fire_bolt(id, avatar_id, center, input.aim);
        }
    }

    fn fire_bolt(&mut self, shooter: PlayerId, shooter_avatar: EntityId, origin: Vec2, aim: f32) {
        let target = clamp_to_world(origin + Vec2::from_angle(aim) * BOLT_RANGE, 0.0);
        self.insert_entity(
            EntityKind::LightningBolt,
            Some(shooter),
            EntityState {
                position: origin,
                target,
                intensity: 1.0,
                ..EntityState::default()
            },
            Some(BOLT_LIFETIME),
        );

        let victims: Vec<(PlayerId, EntityId)> = self
            .entities
            .values()
            .filter(|e| e.kind == EntityKind::Avatar && e.id != shooter_avatar)
            .filter(|e| {
                distance_to_segment(e.state.position, origin, target)
                    <= e.state.radius + BOLT_HIT_WIDTH
            })
            .filter_map(|e| e.owner.map(|owner| (owner, e.id)))
            .collect();

        for (victim, avatar) in victims {
            debug!("{} struck {}", shooter, victim);
            self.record_kill(shooter, victim);
            let position = self.random_position();
            if let Some(entity) = self.entities.get_mut(&avatar) {
                entity.state.position = position;
                entity.dirty = true;
            }
        }
    }

    fn record_kill(&mut self, killer: PlayerId, victim: PlayerId) {
        if let Some(record) = self.players.get_mut(&killer) {
            record.kills += 1;
            record.score += 1;
        }
        if let Some(record) = self.players.get_mut(&victim) {
            record.deaths += 1;
            record.score -= 1;
        }
        self.events.push(WorldEvent::Kill { killer, victim });
        self.events.push(WorldEvent::StatsChanged(killer));
        self.events.push(WorldEvent::StatsChanged(victim));
    }

    fn age_bolts(&mut self, dt: f32) {
        let mut expired = Vec::new();
        for entity in self.entities.values_mut() {
            if let Some(ttl) = entity.ttl.as_mut() {
                *ttl -= dt;
                entity.state.intensity = (*ttl / BOLT_LIFETIME).max(0.0);
                entity.dirty = true;
                if *ttl <= 0.0 {
                    expired.push(entity.id);
                }
            }
        }
        for id in expired {
            self.remove_entity(id);
        }
    }

    fn insert_entity(
        &mut self,
        kind: EntityKind,
        owner: Option<PlayerId>,
        state: EntityState,
        ttl: Option<f32>,
    ) -> EntityId {
        let id = EntityId(self.next_entity_id);
        self.next_entity_id += 1;
        let entity = Entity {
            id,
            kind,
            owner,
            state,
            dirty: false,
            ttl,
        };
        self.events.push(WorldEvent::EntityAdded(entity.to_add()));
        self.entities.insert(id, entity);
        id
    }

    fn remove_entity(&mut self, id: EntityId) {
        if self.entities.remove(&id).is_some() {
            self.events.push(WorldEvent::EntityRemoved(id));
        }
    }

    fn random_position(&mut self) -> Vec2 {
        let margin = AVATAR_RADIUS * 2.0;
        Vec2::new(
            self.rng.gen_range(margin..WORLD_WIDTH - margin),
            self.rng.gen_range(margin..WORLD_HEIGHT - margin),
        )
    }

    /// Takes every event recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.events)
    }

    /// `EntityAdd` for every live entity, in id order.
    pub fn snapshot(&self) -> Vec<EntityAdd> {
        self.entities.values().map(Entity::to_add).collect()
    }

    pub fn stats(&self, id: PlayerId) -> Option<PlayerStats> {
        self.players.get(&id).map(|record| PlayerStats {
            player: id,
            kills: record.kills,
            deaths: record.deaths,
            score: record.score,
        })
    }

    pub fn player(&self, id: PlayerId) -> Option<&PlayerRecord> {
        self.players.get(&id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Unreliable updates for changed entities, or for all of them when
    /// `full_refresh` is set. Clears the changed flags.
    pub fn delta_messages(&mut self, full_refresh: bool, counters: &mut SequenceCounters) -> Vec<Message> {
        let mut messages = Vec::new();
        for entity in self.entities.values_mut() {
            if !entity.dirty && !full_refresh {
                continue;
            }
            entity.dirty = false;

            let id = entity.id;
            let state = entity.state;
            match entity.kind {
                EntityKind::Avatar => {
                    messages.push(Message::TransformUpdate(TransformUpdate {
                        sequence: counters.next(ChannelKey::entity(MessageKind::TransformUpdate, id)),
                        entity: id,
                        position: state.position,
                        rotation: state.rotation,
                    }));
                    messages.push(Message::CircleUpdate(CircleUpdate {
                        sequence: counters.next(ChannelKey::entity(MessageKind::CircleUpdate, id)),
                        entity: id,
                        velocity: state.velocity,
                        radius: state.radius,
                    }));
                }
                EntityKind::Orb => {
                    messages.push(Message::OrbUpdate(OrbUpdate {
                        sequence: counters.next(ChannelKey::entity(MessageKind::OrbUpdate, id)),
                        entity: id,
                        charge: state.charge,
                        orbit_angle: state.orbit_angle,
                    }));
                }
                EntityKind::LightningBolt => {
                    messages.push(Message::LightningUpdate(LightningUpdate {
                        sequence: counters.next(ChannelKey::entity(MessageKind::LightningUpdate, id)),
                        entity: id,
                        origin: state.position,
                        target: state.target,
                        intensity: state.intensity,
                    }));
                }
            }
        }
        messages
    }
}

impl Default for GameState {
    fn default() -> Self {
        Self::new()
    }
}

fn distance_to_segment(point: Vec2, start: Vec2, end: Vec2) -> f32 {
    let segment = end - start;
    let len_sq = segment.dot(segment);
    if len_sq == 0.0 {
        return point.distance(start);
    }
    let t = ((point - start).dot(segment) / len_sq).clamp(0.0, 1.0);
    point.distance(start + segment * t)
}
