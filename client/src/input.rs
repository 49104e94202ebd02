//! Client input management with sequencing
//!
//! There is no window, so input comes from the caller (or the [`Autopilot`])
//! rather than the keyboard. Every input sent carries the next value of a
//! per-session sequence so the server can drop late arrivals.

use crate::game::ClientWorld;
use arena_shared::message::PlayerInput;
use arena_shared::{EntityKind, PlayerId, Vec2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Distance at which the autopilot fires; a little under the bolt range.
const FIRE_RANGE: f32 = 380.0;
/// Ticks between autopilot course changes.
const WANDER_TICKS: u32 = 45;

/// Current control state plus the input sequence counter
pub struct InputManager {
    next_sequence: u32,
    move_dir: Vec2,
    aim: f32,
    fire: bool,
}

impl InputManager {
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            move_dir: Vec2::ZERO,
            aim: 0.0,
            fire: false,
        }
    }

    /// Sets the desired movement direction; it is normalized when sent.
    pub fn set_movement(&mut self, direction: Vec2) {
        self.move_dir = direction;
    }

    pub fn set_aim(&mut self, angle: f32) {
        self.aim = angle;
    }

    pub fn set_fire(&mut self, fire: bool) {
        self.fire = fire;
    }

    /// Stamps the current controls with the next sequence number.
    pub fn next_input(&mut self, player: PlayerId) -> PlayerInput {
        let input = PlayerInput {
            sequence: self.next_sequence,
            player,
            move_dir: self.move_dir.normalized(),
            aim: self.aim,
            fire: self.fire,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        input
    }

    /// Back to idle controls and sequence 1, for a fresh session.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for InputManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Headless driver: wanders, aims at the nearest other avatar and fires when
/// it is in range.
pub struct Autopilot {
    rng: StdRng,
    heading: Vec2,
    ticks_on_course: u32,
}

impl Autopilot {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            heading: Vec2::ZERO,
            ticks_on_course: WANDER_TICKS,
        }
    }

    /// Updates `input` from the mirrored world.
    pub fn drive(&mut self, player: PlayerId, world: &ClientWorld, input: &mut InputManager) {
        self.ticks_on_course += 1;
        if self.ticks_on_course >= WANDER_TICKS {
            self.ticks_on_course = 0;
            let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
            self.heading = Vec2::from_angle(angle);
        }
        input.set_movement(self.heading);

        let Some(me) = world.avatar_of(player).map(|e| e.state.position) else {
            input.set_fire(false);
            return;
        };

        let nearest = world
            .entities()
            .filter(|e| e.kind == EntityKind::Avatar && e.owner != Some(player))
            .map(|e| e.state.position)
            .min_by(|a, b| me.distance(*a).total_cmp(&me.distance(*b)));

        match nearest {
            Some(target) => {
                let offset = target - me;
                input.set_aim(offset.y.atan2(offset.x));
                input.set_fire(offset.length() <= FIRE_RANGE);
            }
            None => input.set_fire(false),
        }
    }
}

impl Default for Autopilot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_shared::message::EntityAdd;
    use arena_shared::{EntityId, EntityState, Message};
    use assert_approx_eq::assert_approx_eq;

    fn add_avatar(world: &mut ClientWorld, id: u32, owner: u32, position: Vec2) {
        world.apply(&Message::EntityAdd(EntityAdd {
            entity: EntityId(id),
            kind: EntityKind::Avatar,
            owner: Some(PlayerId(owner)),
            state: EntityState {
                position,
                radius: 18.0,
                ..EntityState::default()
            },
        }));
    }

    #[test]
    fn test_input_manager_creation() {
        let input_manager = InputManager::new();
        assert_eq!(input_manager.next_sequence, 1);
        assert!(!input_manager.fire);
    }

    #[test]
    fn test_sequences_increase_per_input() {
        let mut input = InputManager::new();
        input.set_movement(Vec2::new(3.0, 4.0));

        let first = input.next_input(PlayerId(2));
        let second = input.next_input(PlayerId(2));
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(first.player, PlayerId(2));
        assert_approx_eq!(first.move_dir.length(), 1.0, 1e-6);

        input.reset();
        assert_eq!(input.next_input(PlayerId(2)).sequence, 1);
    }

    #[test]
    fn test_autopilot_aims_and_fires_at_nearby_avatar() {
        let mut world = ClientWorld::new();
        add_avatar(&mut world, 1, 1, Vec2::new(100.0, 100.0));
        add_avatar(&mut world, 2, 2, Vec2::new(100.0, 300.0));
        add_avatar(&mut world, 3, 3, Vec2::new(1500.0, 800.0));

        let mut pilot = Autopilot::seeded(3);
        let mut input = InputManager::new();
        pilot.drive(PlayerId(1), &world, &mut input);

        let sent = input.next_input(PlayerId(1));
        assert!(sent.fire);
        assert_approx_eq!(sent.aim, std::f32::consts::FRAC_PI_2, 1e-5);
        assert_approx_eq!(sent.move_dir.length(), 1.0, 1e-5);
    }

    #[test]
    fn test_autopilot_holds_fire_without_targets() {
        let mut world = ClientWorld::new();
        add_avatar(&mut world, 1, 1, Vec2::new(100.0, 100.0));

        let mut pilot = Autopilot::seeded(3);
        let mut input = InputManager::new();
        input.set_fire(true);
        pilot.drive(PlayerId(1), &world, &mut input);
        assert!(!input.next_input(PlayerId(1)).fire);
    }
}
