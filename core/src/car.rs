//! Per-player runtime car state and the canonical input record.

use crate::math::Vec2;
use crate::physics::NITRO_MAX;
use crate::track::TrackElement;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PlayerId = Uuid;

/// Runtime state of one car. Created at race start from a spawn element,
/// mutated only by the physics integrator and the race arbiter on the
/// owning room's tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarState {
    pub id: Uuid,
    pub player_id: PlayerId,

    pub position: Vec2,
    pub rotation: f32,
    pub velocity: Vec2,
    pub angular_velocity: f32,
    /// Cached scalar speed, refreshed every physics step.
    pub speed: f32,
    pub steering_angle: f32,

    pub nitro: f32,
    pub damage: u8,
    pub layer: i8,

    // Race progress
    pub next_checkpoint: u32,
    pub lap: u32,
    pub lap_times: Vec<f64>,
    pub finished: bool,
    pub finish_time: Option<f64>,
    pub rank: u32,

    pub last_input_sequence: u32,
    /// Rising-edge latch for finish line crossings.
    pub passed_finish_line: bool,
    /// Rising-edge latch for respawn requests.
    pub respawn_latch: bool,

    // Stuck detection baselines (ms on the race clock)
    pub last_position: Vec2,
    pub last_position_at: f64,
    pub stuck_since: Option<f64>,

    // Respawn fallback when no checkpoint has been passed yet
    pub spawn_position: Vec2,
    pub spawn_rotation: f32,
}

impl CarState {
    pub fn at_spawn(player_id: PlayerId, spawn: &TrackElement) -> Self {
        Self {
            id: Uuid::new_v4(),
            player_id,
            position: spawn.center(),
            rotation: spawn.rotation,
            velocity: Vec2::ZERO,
            angular_velocity: 0.0,
            speed: 0.0,
            steering_angle: 0.0,
            nitro: NITRO_MAX,
            damage: 0,
            layer: spawn.layer.unwrap_or(0),
            next_checkpoint: 0,
            lap: 0,
            lap_times: Vec::new(),
            finished: false,
            finish_time: None,
            rank: 0,
            last_input_sequence: 0,
            passed_finish_line: false,
            respawn_latch: false,
            last_position: spawn.center(),
            last_position_at: 0.0,
            stuck_since: None,
            spawn_position: spawn.center(),
            spawn_rotation: spawn.rotation,
        }
    }

    /// Place the car at an element center with zeroed motion, used for
    /// respawns.
    pub fn teleport_to(&mut self, target: Vec2, rotation: f32) {
        self.position = target;
        self.rotation = rotation;
        self.velocity = Vec2::ZERO;
        self.angular_velocity = 0.0;
        self.speed = 0.0;
        self.last_position = target;
        self.stuck_since = None;
    }

    /// Sum of recorded lap times in ms.
    pub fn total_lap_time(&self) -> f64 {
        self.lap_times.iter().sum()
    }
}

/// One input record as applied by the integrator. The server keeps only
/// the most recent record per player; the client keeps a bounded FIFO of
/// unconfirmed records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputState {
    pub sequence: u32,
    pub timestamp: f64,
    pub accelerate: bool,
    pub brake: bool,
    pub steer_left: bool,
    pub steer_right: bool,
    pub nitro: bool,
    pub handbrake: bool,
    pub respawn: bool,
    #[serde(default)]
    pub steer_value: f32,
}

impl InputState {
    /// Clamp the analog channel and zero anything non-finite. Applied once
    /// at ingress; the integrator trusts its input.
    pub fn sanitize(&mut self) {
        if !self.steer_value.is_finite() {
            self.steer_value = 0.0;
        }
        self.steer_value = self.steer_value.clamp(-1.0, 1.0);
        if !self.timestamp.is_finite() {
            self.timestamp = 0.0;
        }
    }

    /// Scalar steering input: analog wins when nonzero, else the booleans.
    pub fn steer_input(&self) -> f32 {
        if self.steer_value != 0.0 {
            self.steer_value
        } else {
            let mut steer = 0.0;
            if self.steer_left {
                steer -= 1.0;
            }
            if self.steer_right {
                steer += 1.0;
            }
            steer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Track;

    #[test]
    fn test_car_spawns_at_element_center() {
        let track = Track::default_speedway();
        let spawn = track.spawns()[0];
        let car = CarState::at_spawn(Uuid::new_v4(), spawn);

        assert_eq!(car.position, spawn.center());
        assert_eq!(car.rotation, spawn.rotation);
        assert_eq!(car.nitro, NITRO_MAX);
        assert_eq!(car.lap, 0);
        assert_eq!(car.next_checkpoint, 0);
    }

    #[test]
    fn test_teleport_zeroes_motion() {
        let track = Track::default_speedway();
        let mut car = CarState::at_spawn(Uuid::new_v4(), track.spawns()[0]);
        car.velocity = Vec2::new(5.0, -3.0);
        car.angular_velocity = 0.2;

        car.teleport_to(Vec2::new(100.0, 100.0), 1.0);

        assert_eq!(car.velocity, Vec2::ZERO);
        assert_eq!(car.angular_velocity, 0.0);
        assert_eq!(car.position, Vec2::new(100.0, 100.0));
    }

    #[test]
    fn test_sanitize_clamps_analog_steer() {
        let mut input = InputState {
            steer_value: 3.0,
            ..Default::default()
        };
        input.sanitize();
        assert_eq!(input.steer_value, 1.0);

        input.steer_value = f32::NAN;
        input.sanitize();
        assert_eq!(input.steer_value, 0.0);
    }

    #[test]
    fn test_analog_steer_wins_over_booleans() {
        let input = InputState {
            steer_left: true,
            steer_value: 0.5,
            ..Default::default()
        };
        assert_eq!(input.steer_input(), 0.5);

        let input = InputState {
            steer_left: true,
            ..Default::default()
        };
        assert_eq!(input.steer_input(), -1.0);

        let input = InputState {
            steer_left: true,
            steer_right: true,
            ..Default::default()
        };
        assert_eq!(input.steer_input(), 0.0);
    }
}
