//! Quantized broadcast records.
//!
//! Snapshots go out at 20 Hz to every player in a room, so the per-car
//! record trades precision for size: positions and velocities are rounded
//! to 0.01, angles to 0.001, speed to 0.1. Round-trips therefore reproduce
//! floats within those grains and integers exactly; consumers must not
//! compare snapshot floats for strict equality against live state.

use crate::car::{CarState, PlayerId};
use crate::math::Vec2;
use crate::protocol::RoomState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn q(value: f32, grain: f32) -> f32 {
    (value / grain).round() * grain
}

/// Round to the documented wire grains.
pub fn quantize_position(v: f32) -> f32 {
    q(v, 0.01)
}
pub fn quantize_angle(v: f32) -> f32 {
    q(v, 0.001)
}
pub fn quantize_speed(v: f32) -> f32 {
    q(v, 0.1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarSnapshot {
    pub id: Uuid,
    pub player_id: PlayerId,
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    pub vx: f32,
    pub vy: f32,
    pub angular_velocity: f32,
    pub steering_angle: f32,
    pub speed: f32,
    pub nitro: u32,
    pub damage: u8,
    pub lap: u32,
    pub checkpoint: u32,
    pub position_rank: u32,
    pub finished: bool,
    pub layer: i8,
    pub last_input_sequence: u32,
}

impl From<&CarState> for CarSnapshot {
    fn from(car: &CarState) -> Self {
        Self {
            id: car.id,
            player_id: car.player_id,
            x: quantize_position(car.position.x),
            y: quantize_position(car.position.y),
            rotation: quantize_angle(car.rotation),
            vx: quantize_position(car.velocity.x),
            vy: quantize_position(car.velocity.y),
            angular_velocity: quantize_angle(car.angular_velocity),
            steering_angle: quantize_angle(car.steering_angle),
            speed: quantize_speed(car.speed),
            nitro: car.nitro.round() as u32,
            damage: car.damage.min(3),
            lap: car.lap,
            checkpoint: car.next_checkpoint,
            position_rank: car.rank,
            finished: car.finished,
            layer: car.layer,
            last_input_sequence: car.last_input_sequence,
        }
    }
}

impl CarSnapshot {
    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }

    pub fn velocity(&self) -> Vec2 {
        Vec2::new(self.vx, self.vy)
    }
}

/// Events fired between two snapshots, bundled in emit order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaceEvent {
    #[serde(rename_all = "camelCase")]
    Checkpoint {
        player_id: PlayerId,
        checkpoint: u32,
        time: f64,
    },
    #[serde(rename_all = "camelCase")]
    Lap {
        player_id: PlayerId,
        lap: u32,
        lap_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    Finish {
        player_id: PlayerId,
        position: u32,
        total_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    Respawn { player_id: PlayerId },
    #[serde(rename_all = "camelCase")]
    Collision {
        player_id: PlayerId,
        other_player_id: PlayerId,
        impulse: f32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    /// Monotonic per room, starting at 1.
    pub sequence: u64,
    /// Server wall clock in ms.
    pub timestamp: f64,
    pub game_state: RoomState,
    /// Race clock in ms since `game_started`.
    pub race_time_ms: f64,
    pub cars: Vec<CarSnapshot>,
    pub events: Vec<RaceEvent>,
}
