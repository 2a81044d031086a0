//! Fixed-tick arcade car physics.
//!
//! The same `step` runs authoritatively on the server and speculatively in
//! the client predictor. Both sides must produce identical trajectories
//! from identical state and input, so the constants and the stage order
//! below are load-bearing: reordering stages or "simplifying" the numeric
//! forms changes results enough to break reconciliation.
//!
//! Force units follow the reference physics backend: forces are applied
//! per-millisecond-squared against `DT_MS`, with the car body modeled as a
//! 30x20 rectangle of density 0.002 (mass 1.2) and infinite rotational
//! inertia (steering writes angular velocity directly, torque is ignored).

use crate::car::{CarState, InputState};
use crate::math::{wrap_coord, Vec2};
use crate::track::Track;
use tracing::warn;

/// Authoritative simulation rate (Hz).
pub const PHYSICS_TICK_RATE: u32 = 60;
/// Snapshot broadcast rate (Hz).
pub const STATE_BROADCAST_RATE: u32 = 20;
/// Fixed timestep in milliseconds.
pub const DT_MS: f32 = 1000.0 / 60.0;
/// Fixed timestep in seconds, for frame accumulators.
pub const DT_SECS: f32 = 1.0 / 60.0;

pub const ENGINE_FORCE: f32 = 2.0;
pub const REVERSE_FORCE: f32 = 1.2;
pub const BRAKE_FACTOR: f32 = 0.95;
pub const DRAG_COEFFICIENT: f32 = 0.001;
pub const ROLLING_RESISTANCE: f32 = 0.005;
pub const FRICTION_AIR: f32 = 0.01;
/// density 0.002 * 30 * 20 body
pub const CAR_MASS: f32 = 1.2;

pub const MAX_SPEED: f32 = 15.0;
pub const MAX_REVERSE_SPEED: f32 = 5.0;
pub const NITRO_BOOST_MULTIPLIER: f32 = 1.5;
pub const NITRO_MAX: f32 = 100.0;
/// Tank units drained per tick while nitro is burning.
pub const NITRO_CONSUMPTION_RATE: f32 = 0.5;

pub const MAX_STEERING_ANGLE: f32 = std::f32::consts::FRAC_PI_4;
pub const STEERING_RESPONSE: f32 = 0.18;
pub const STEERING_CENTERING: f32 = 0.85;
pub const MAX_ANGULAR_VELOCITY: f32 = 0.25;
/// Below this speed steering input has no authority.
pub const MIN_STEER_SPEED: f32 = 0.5;

/// Forward unit vector for a rotation. Zero rotation faces up the screen.
pub fn forward(rotation: f32) -> Vec2 {
    Vec2::new(rotation.sin(), -rotation.cos())
}

/// Advance one car by exactly one tick under the given input.
///
/// Never fails: a missing input is represented by `InputState::default()`
/// and the car coasts under drag. Positions are left unbounded; the server
/// applies `wrap_position` afterwards, the client predictor never does.
pub fn step(car: &mut CarState, input: &InputState) {
    let fwd = forward(car.rotation);
    let speed = car.velocity.length();
    let forward_speed = car.velocity.dot(fwd);

    // Stage 1: force accumulation
    let mut force = Vec2::ZERO;
    if input.accelerate && speed < MAX_SPEED {
        force += fwd * (ENGINE_FORCE * 0.001);
    }
    let nitro_active = input.nitro && car.nitro > 0.0;
    if nitro_active {
        force += fwd * (ENGINE_FORCE * 0.0015);
        car.nitro = (car.nitro - NITRO_CONSUMPTION_RATE).max(0.0);
    }

    // Stage 2: direct velocity modification by the brake
    if input.brake {
        if forward_speed > 1.0 {
            car.velocity = car.velocity * BRAKE_FACTOR;
        } else if forward_speed > -MAX_REVERSE_SPEED {
            force -= fwd * (REVERSE_FORCE * 0.001);
        }
    }

    // Stage 3: steering
    let steer = input.steer_input();
    if speed > MIN_STEER_SPEED && steer != 0.0 {
        let speed_factor = if speed < 3.0 {
            speed / 3.0
        } else if speed <= 15.0 {
            1.0
        } else {
            (15.0 / speed).max(0.5)
        };
        let mut angular = steer * MAX_STEERING_ANGLE * STEERING_RESPONSE * speed_factor;
        if forward_speed < 0.0 {
            angular = -angular;
        }
        car.angular_velocity = angular;
    } else {
        car.angular_velocity *= STEERING_CENTERING;
    }
    car.angular_velocity = car
        .angular_velocity
        .clamp(-MAX_ANGULAR_VELOCITY, MAX_ANGULAR_VELOCITY);
    car.steering_angle = steer * MAX_STEERING_ANGLE;

    // Stage 4: drag against the pre-drag speed
    let pre_drag_speed = car.velocity.length();
    let drag = (1.0 - DRAG_COEFFICIENT * pre_drag_speed - ROLLING_RESISTANCE).max(0.0);
    car.velocity = car.velocity * drag;

    // Stage 5: speed clamp
    let cap = if nitro_active {
        MAX_SPEED * NITRO_BOOST_MULTIPLIER
    } else {
        MAX_SPEED
    };
    let clamped_speed = car.velocity.length();
    if clamped_speed > cap {
        car.velocity = car.velocity * (cap / clamped_speed);
    }

    // Stage 6: Verlet-style integration (per-ms-squared force units)
    car.velocity = car.velocity * (1.0 - FRICTION_AIR) + force * (DT_MS * DT_MS / CAR_MASS);
    car.angular_velocity *= 1.0 - FRICTION_AIR;
    car.rotation += car.angular_velocity;

    // Stage 7: position update
    car.position += car.velocity;
    car.speed = car.velocity.length();
    car.last_input_sequence = car.last_input_sequence.max(input.sequence);
}

/// Server-side wrap into `[0, W) x [0, H)` on wrap-around tracks.
///
/// Also refreshes the stuck-detection baseline so a wrap never registers
/// as teleport-like movement. Guards against non-finite state: rather than
/// propagate a poisoned position into the broadcast, the car keeps its
/// last baseline position with zeroed velocity.
pub fn wrap_position(car: &mut CarState, track: &Track) {
    if !car.position.is_finite() || !car.velocity.is_finite() || !car.rotation.is_finite() {
        warn!(player = %car.player_id, "non-finite car state after step, resetting motion");
        car.position = car.last_position;
        car.velocity = Vec2::ZERO;
        car.angular_velocity = 0.0;
        car.speed = 0.0;
        if !car.rotation.is_finite() {
            car.rotation = 0.0;
        }
        return;
    }
    if track.wrap_around {
        let before = car.position;
        car.position.x = wrap_coord(car.position.x, track.width as f32);
        car.position.y = wrap_coord(car.position.y, track.height as f32);
        // A wrap is a coordinate-frame shift, not movement: rebase the
        // stuck-detection anchor only when one actually happened.
        if car.position != before {
            car.last_position = car.position;
        }
    }
}
