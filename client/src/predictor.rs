//! Client-side prediction with server reconciliation.
//!
//! The predictor owns a car in *unbounded* continuous coordinates and runs
//! the exact same integrator as the server. Local inputs apply immediately
//! for responsiveness and queue in a bounded FIFO until the server
//! acknowledges them through `lastInputSequence`; authoritative snapshots
//! are blended in gently, or snapped when the divergence is too large to
//! hide (respawns, teleports).
//!
//! On wrap-around tracks the server broadcasts positions inside
//! `[0,W)x[0,H)` while this car keeps counting past the seam; snapshots
//! are lifted into the predictor's frame by whole track extents before
//! comparison, so driving off one edge never looks like a jump.

use gridrush_core::car::{CarState, InputState};
use gridrush_core::math::{shortest_angle_delta, unwrap_toward, Vec2};
use gridrush_core::physics::{self, DT_SECS};
use gridrush_core::snapshot::CarSnapshot;
use gridrush_core::track::Track;
use std::collections::VecDeque;
use tracing::warn;

/// Corrections beyond this snap instead of blending.
pub const SNAP_THRESHOLD: f32 = 150.0;
/// Unconfirmed input cap; oldest records fall off first.
pub const MAX_PENDING_INPUTS: usize = 120;

const VELOCITY_BLEND: f32 = 0.15;
const ANGULAR_BLEND: f32 = 0.15;
const ROTATION_BLEND: f32 = 0.3;
const POSITION_BLEND: f32 = 0.1;
/// Corrections below half a pixel are left alone.
const MIN_CORRECTION: f32 = 0.5;
/// Frame-time budget per advance; longer stalls drop simulation time
/// instead of spiraling.
const MAX_FRAME_SECS: f32 = 0.25;

pub struct Predictor {
    car: CarState,
    pending: VecDeque<InputState>,
    current_input: InputState,
    last_confirmed_sequence: u32,
    accumulator: f32,
    track_width: f32,
    track_height: f32,
    wrap_around: bool,
    last_correction_dist: f32,
}

impl Predictor {
    pub fn new(car: CarState, track: &Track) -> Self {
        Self {
            car,
            pending: VecDeque::with_capacity(MAX_PENDING_INPUTS),
            current_input: InputState::default(),
            last_confirmed_sequence: 0,
            accumulator: 0.0,
            track_width: track.width as f32,
            track_height: track.height as f32,
            wrap_around: track.wrap_around,
            last_correction_dist: 0.0,
        }
    }

    pub fn car(&self) -> &CarState {
        &self.car
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_confirmed_sequence(&self) -> u32 {
        self.last_confirmed_sequence
    }

    /// Distance of the latest position correction, for the debug overlay.
    pub fn last_correction_dist(&self) -> f32 {
        self.last_correction_dist
    }

    /// Record a local input event: queue it, make it the held input, and
    /// run one immediate step so the car reacts this frame.
    pub fn apply_input(&mut self, input: InputState) {
        if self.pending.len() >= MAX_PENDING_INPUTS {
            self.pending.pop_front();
        }
        self.pending.push_back(input);
        self.current_input = input;
        physics::step(&mut self.car, &input);
    }

    /// Feed elapsed real time; runs fixed steps with the held input so the
    /// simulation rate is independent of the display refresh.
    pub fn advance(&mut self, frame_dt_secs: f32) {
        self.accumulator += frame_dt_secs.min(MAX_FRAME_SECS);
        while self.accumulator >= DT_SECS {
            physics::step(&mut self.car, &self.current_input);
            self.accumulator -= DT_SECS;
        }
    }

    /// Reconcile against the authoritative car record from a snapshot.
    pub fn reconcile(&mut self, snap: &CarSnapshot) {
        // Acknowledged inputs are done with.
        self.pending
            .retain(|input| input.sequence > snap.last_input_sequence);
        self.last_confirmed_sequence = self
            .last_confirmed_sequence
            .max(snap.last_input_sequence);

        // Lift the wrapped server position into this car's frame.
        let target = if self.wrap_around {
            Vec2::new(
                unwrap_toward(snap.x, self.car.position.x, self.track_width),
                unwrap_toward(snap.y, self.car.position.y, self.track_height),
            )
        } else {
            snap.position()
        };

        if !self.car.position.is_finite() || !self.car.velocity.is_finite() {
            warn!("non-finite predicted state, snapping to server");
            self.hard_snap(target, snap);
            self.last_correction_dist = 0.0;
            self.sync_progress(snap);
            return;
        }

        let target_velocity = snap.velocity();
        self.car.velocity = self
            .car
            .velocity
            .lerp(target_velocity, VELOCITY_BLEND);
        self.car.angular_velocity += (snap.angular_velocity - self.car.angular_velocity) * ANGULAR_BLEND;
        self.car.rotation +=
            shortest_angle_delta(self.car.rotation, snap.rotation) * ROTATION_BLEND;

        let dist = self.car.position.distance(target);
        self.last_correction_dist = dist;
        if dist > SNAP_THRESHOLD {
            // Respawns and teleports: no amount of blending hides these.
            self.hard_snap(target, snap);
        } else if dist > MIN_CORRECTION {
            self.car.position = self.car.position.lerp(target, POSITION_BLEND);
        }

        self.sync_progress(snap);
    }

    fn hard_snap(&mut self, target: Vec2, snap: &CarSnapshot) {
        self.car.position = target;
        self.car.rotation = snap.rotation;
        self.car.velocity = snap.velocity();
        self.car.angular_velocity = snap.angular_velocity;
        self.car.speed = self.car.velocity.length();
    }

    /// Authoritative race bookkeeping always wins.
    fn sync_progress(&mut self, snap: &CarSnapshot) {
        self.car.lap = snap.lap;
        self.car.next_checkpoint = snap.checkpoint;
        self.car.rank = snap.position_rank;
        self.car.finished = snap.finished;
        self.car.nitro = snap.nitro as f32;
        self.car.damage = snap.damage;
        self.car.layer = snap.layer;
    }

    /// The server respawned us: kill local momentum and forget every
    /// speculative input.
    pub fn handle_respawn(&mut self) {
        self.car.velocity = Vec2::ZERO;
        self.car.angular_velocity = 0.0;
        self.car.speed = 0.0;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrush_core::track::Track;
    use uuid::Uuid;

    fn test_setup() -> (Predictor, CarState, Track) {
        let track = Track::default_speedway();
        let spawn = track.spawns()[0];
        let car = CarState::at_spawn(Uuid::new_v4(), spawn);
        let predictor = Predictor::new(car.clone(), &track);
        (predictor, car, track)
    }

    fn accelerate(sequence: u32) -> InputState {
        InputState {
            sequence,
            accelerate: true,
            ..Default::default()
        }
    }

    fn snapshot_from(car: &CarState) -> CarSnapshot {
        CarSnapshot::from(car)
    }

    #[test]
    fn test_input_applies_immediately() {
        let (mut predictor, car, _) = test_setup();
        let before = car.position;
        predictor.apply_input(accelerate(1));
        assert_ne!(predictor.car().position, before);
        assert_eq!(predictor.pending_len(), 1);
    }

    #[test]
    fn test_accumulator_runs_fixed_steps() {
        let (mut predictor, _, _) = test_setup();
        predictor.apply_input(accelerate(1));
        let after_input = predictor.car().position;

        // Half a tick of real time: no step yet.
        predictor.advance(DT_SECS * 0.5);
        assert_eq!(predictor.car().position, after_input);

        // The other half completes one step.
        predictor.advance(DT_SECS * 0.5);
        assert_ne!(predictor.car().position, after_input);
    }

    #[test]
    fn test_matches_server_integration_exactly() {
        let (mut predictor, mut server_car, _) = test_setup();
        let input = accelerate(1);

        // One immediate step plus 59 accumulated steps on the client,
        // 60 plain steps on the server.
        predictor.apply_input(input);
        for _ in 0..59 {
            predictor.advance(DT_SECS);
        }
        for _ in 0..60 {
            physics::step(&mut server_car, &input);
        }

        assert_eq!(predictor.car().position, server_car.position);
        assert_eq!(predictor.car().velocity, server_car.velocity);
    }

    #[test]
    fn test_fifo_capped() {
        let (mut predictor, _, _) = test_setup();
        for sequence in 1..=(MAX_PENDING_INPUTS as u32 + 40) {
            predictor.apply_input(InputState {
                sequence,
                ..Default::default()
            });
        }
        assert_eq!(predictor.pending_len(), MAX_PENDING_INPUTS);
    }

    #[test]
    fn test_acknowledged_inputs_dropped() {
        let (mut predictor, car, _) = test_setup();
        for sequence in 1..=10 {
            predictor.apply_input(accelerate(sequence));
        }

        let mut snap = snapshot_from(&car);
        snap.last_input_sequence = 6;
        // Keep the server close to the prediction so no snap occurs.
        snap.x = predictor.car().position.x;
        snap.y = predictor.car().position.y;
        predictor.reconcile(&snap);

        assert_eq!(predictor.pending_len(), 4);
        assert_eq!(predictor.last_confirmed_sequence(), 6);
    }

    #[test]
    fn test_small_divergence_blends() {
        let (mut predictor, car, _) = test_setup();
        let mut snap = snapshot_from(&car);
        snap.x = car.position.x + 10.0;

        let before = predictor.car().position.x;
        predictor.reconcile(&snap);
        let after = predictor.car().position.x;

        // Blend factor 0.1 moves one pixel of a ten pixel error.
        assert!((after - before - 1.0).abs() < 0.01, "moved {}", after - before);
        assert!((predictor.last_correction_dist() - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_sub_pixel_divergence_ignored() {
        let (mut predictor, car, _) = test_setup();
        let mut snap = snapshot_from(&car);
        snap.x = car.position.x + 0.3;

        let before = predictor.car().position;
        predictor.reconcile(&snap);
        assert_eq!(predictor.car().position, before);
    }

    #[test]
    fn test_large_divergence_snaps() {
        let (mut predictor, car, _) = test_setup();
        let mut snap = snapshot_from(&car);
        snap.x = car.position.x + SNAP_THRESHOLD + 50.0;
        snap.vx = 3.0;
        snap.rotation = 1.0;

        predictor.reconcile(&snap);

        assert!((predictor.car().position.x - snap.x).abs() < 0.01);
        assert!((predictor.car().velocity.x - 3.0).abs() < 0.01);
        assert!((predictor.car().rotation - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_wrap_seam_is_not_a_jump() {
        let track = {
            let mut t = Track::default_speedway();
            t.wrap_around = true;
            t
        };
        let spawn = track.spawns()[0];
        let mut car = CarState::at_spawn(Uuid::new_v4(), spawn);
        car.position = Vec2::new(805.0, 300.0); // predictor ran past the seam
        let mut predictor = Predictor::new(car.clone(), &track);

        // Server broadcasts the wrapped coordinate.
        let mut snap = snapshot_from(&car);
        snap.x = 5.0;
        snap.y = 300.0;
        predictor.reconcile(&snap);

        assert!(
            (predictor.car().position.x - 805.0).abs() < 0.1,
            "seam crossing caused a correction: x = {}",
            predictor.car().position.x
        );
        assert!(predictor.last_correction_dist() < 1.0);
    }

    #[test]
    fn test_predictor_never_wraps() {
        let track = {
            let mut t = Track::default_speedway();
            t.wrap_around = true;
            t
        };
        let spawn = track.spawns()[0];
        let mut car = CarState::at_spawn(Uuid::new_v4(), spawn);
        car.position = Vec2::new(795.0, 300.0);
        car.rotation = std::f32::consts::FRAC_PI_2; // heading +x
        let mut predictor = Predictor::new(car, &track);

        predictor.apply_input(accelerate(1));
        for _ in 0..120 {
            predictor.advance(DT_SECS); // two seconds of driving right
        }

        assert!(
            predictor.car().position.x > 800.0,
            "predictor coordinates must stay unbounded, x = {}",
            predictor.car().position.x
        );
    }

    #[test]
    fn test_respawn_clears_state() {
        let (mut predictor, _, _) = test_setup();
        for sequence in 1..=5 {
            predictor.apply_input(accelerate(sequence));
        }
        assert!(predictor.car().speed > 0.0);

        predictor.handle_respawn();
        assert_eq!(predictor.pending_len(), 0);
        assert_eq!(predictor.car().velocity, Vec2::ZERO);
        assert_eq!(predictor.car().speed, 0.0);
    }

    #[test]
    fn test_progress_fields_follow_server() {
        let (mut predictor, car, _) = test_setup();
        let mut snap = snapshot_from(&car);
        snap.lap = 2;
        snap.checkpoint = 1;
        snap.position_rank = 4;
        snap.nitro = 55;

        predictor.reconcile(&snap);
        assert_eq!(predictor.car().lap, 2);
        assert_eq!(predictor.car().next_checkpoint, 1);
        assert_eq!(predictor.car().rank, 4);
        assert_eq!(predictor.car().nitro, 55.0);
    }
}
