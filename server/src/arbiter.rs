//! Race arbitration: checkpoint ordering, lap counting, finish detection,
//! ranking, respawns and the car-to-car collision response.
//!
//! The arbiter runs once per tick after the physics step, always on the
//! owning room's task. It never fails; it mutates car state and appends
//! `RaceEvent`s for the next broadcast.

use gridrush_core::car::CarState;
use gridrush_core::math::Vec2;
use gridrush_core::snapshot::RaceEvent;
use gridrush_core::track::{Track, TrackElement};
use gridrush_core::InputState;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Race moves to results this long after the first finisher even if others
/// are still driving.
pub const FINISH_GRACE_PERIOD_MS: f64 = 30_000.0;
/// A car that moves less than the epsilon for this long is considered
/// stuck (auto-respawn is opt-in).
pub const STUCK_THRESHOLD_MS: f64 = 5_000.0;
const STUCK_MOVE_EPSILON: f32 = 2.0;

/// Car body collision circle, derived from the 30x20 physics body.
const CAR_COLLISION_RADIUS: f32 = 16.0;
/// Upper bound on the bounce-back of the car-to-car impulse response.
/// The exact response is not part of any compatibility contract; clients
/// absorb it through normal reconciliation.
pub const COLLISION_RESTITUTION: f32 = 0.5;
/// Relative speed above which a collision chips the damage ordinal.
const DAMAGE_IMPULSE_THRESHOLD: f32 = 6.0;

pub struct RaceArbiter {
    checkpoints: Vec<TrackElement>,
    finish: TrackElement,
    lap_count: u32,
    stuck_respawn_enabled: bool,
    first_finish_at: Option<f64>,
    finisher_count: u32,
}

impl RaceArbiter {
    pub fn new(track: &Track, lap_count: u32, stuck_respawn_enabled: bool) -> Self {
        Self {
            checkpoints: track.checkpoints().into_iter().cloned().collect(),
            finish: track.finish().clone(),
            lap_count,
            stuck_respawn_enabled,
            first_finish_at: None,
            finisher_count: 0,
        }
    }

    pub fn checkpoint_count(&self) -> u32 {
        self.checkpoints.len() as u32
    }

    /// Arbitrate one tick: respawns, checkpoints, laps, finishes, stuck
    /// timers and the rank order. `elapsed_ms` is the race clock.
    pub fn tick(
        &mut self,
        cars: &mut [CarState],
        inputs: &HashMap<Uuid, InputState>,
        track: &Track,
        elapsed_ms: f64,
        events: &mut Vec<RaceEvent>,
    ) {
        for car in cars.iter_mut() {
            let input = inputs.get(&car.player_id).copied().unwrap_or_default();
            self.handle_respawn(car, &input, track, elapsed_ms, events);
            self.update_stuck_timer(car, track, elapsed_ms, events);
            if !car.finished {
                self.advance_progress(car, track, elapsed_ms, events);
            } else {
                // Keep the latch tracking the finish area so a car idling
                // on the line does not re-trigger anything later.
                car.passed_finish_line = track.within_element(car.position, &self.finish);
            }
        }

        resolve_collisions(cars, events);
        self.assign_ranks(cars, track);
    }

    fn handle_respawn(
        &self,
        car: &mut CarState,
        input: &InputState,
        track: &Track,
        elapsed_ms: f64,
        events: &mut Vec<RaceEvent>,
    ) {
        let requested = input.respawn && !car.respawn_latch;
        car.respawn_latch = input.respawn;

        let stuck = self.stuck_respawn_enabled
            && car
                .stuck_since
                .is_some_and(|since| elapsed_ms - since >= STUCK_THRESHOLD_MS);

        if requested || stuck {
            self.respawn(car, track, events);
        }
    }

    fn respawn(&self, car: &mut CarState, _track: &Track, events: &mut Vec<RaceEvent>) {
        let (target, rotation) = if car.next_checkpoint > 0 {
            let cp = &self.checkpoints[(car.next_checkpoint - 1) as usize];
            (cp.center(), cp.rotation)
        } else {
            (car.spawn_position, car.spawn_rotation)
        };
        car.teleport_to(target, rotation);
        car.passed_finish_line = false;
        debug!(player = %car.player_id, "respawned to {:?}", target);
        events.push(RaceEvent::Respawn {
            player_id: car.player_id,
        });
    }

    fn update_stuck_timer(
        &self,
        car: &mut CarState,
        track: &Track,
        elapsed_ms: f64,
        _events: &mut Vec<RaceEvent>,
    ) {
        if track.distance(car.position, car.last_position) > STUCK_MOVE_EPSILON {
            car.last_position = car.position;
            car.last_position_at = elapsed_ms;
            car.stuck_since = None;
        } else if car.stuck_since.is_none() {
            car.stuck_since = Some(elapsed_ms);
        }
    }

    fn advance_progress(
        &mut self,
        car: &mut CarState,
        track: &Track,
        elapsed_ms: f64,
        events: &mut Vec<RaceEvent>,
    ) {
        // At most one checkpoint per tick; at 60 Hz that is never a
        // practical limit.
        if (car.next_checkpoint as usize) < self.checkpoints.len() {
            let expected = &self.checkpoints[car.next_checkpoint as usize];
            if track.within_element(car.position, expected) {
                let index = car.next_checkpoint;
                car.next_checkpoint += 1;
                events.push(RaceEvent::Checkpoint {
                    player_id: car.player_id,
                    checkpoint: index,
                    time: elapsed_ms,
                });
            }
        }

        let inside_finish = track.within_element(car.position, &self.finish);
        if inside_finish && !car.passed_finish_line {
            car.passed_finish_line = true;
            if car.next_checkpoint as usize == self.checkpoints.len() {
                self.complete_lap(car, elapsed_ms, events);
            }
        } else if !inside_finish {
            car.passed_finish_line = false;
        }
    }

    fn complete_lap(&mut self, car: &mut CarState, elapsed_ms: f64, events: &mut Vec<RaceEvent>) {
        let lap_time = elapsed_ms - car.total_lap_time();
        car.lap += 1;
        car.lap_times.push(lap_time);
        car.next_checkpoint = 0;
        events.push(RaceEvent::Lap {
            player_id: car.player_id,
            lap: car.lap,
            lap_time,
        });

        if car.lap >= self.lap_count {
            self.finisher_count += 1;
            car.finished = true;
            car.finish_time = Some(elapsed_ms);
            car.rank = self.finisher_count;
            if self.first_finish_at.is_none() {
                self.first_finish_at = Some(elapsed_ms);
            }
            events.push(RaceEvent::Finish {
                player_id: car.player_id,
                position: self.finisher_count,
                total_time: elapsed_ms,
            });
        }
    }

    /// Total order recomputed every tick: finishers by finish time, then
    /// the field by lap, checkpoint progress and distance to the next
    /// checkpoint.
    fn assign_ranks(&self, cars: &mut [CarState], track: &Track) {
        let mut order: Vec<usize> = (0..cars.len()).collect();
        order.sort_by(|&a, &b| {
            let ca = &cars[a];
            let cb = &cars[b];
            cb.finished
                .cmp(&ca.finished)
                .then_with(|| match (ca.finish_time, cb.finish_time) {
                    (Some(ta), Some(tb)) => ta.total_cmp(&tb),
                    _ => std::cmp::Ordering::Equal,
                })
                .then_with(|| cb.lap.cmp(&ca.lap))
                .then_with(|| cb.next_checkpoint.cmp(&ca.next_checkpoint))
                .then_with(|| {
                    self.distance_to_next(ca, track)
                        .total_cmp(&self.distance_to_next(cb, track))
                })
        });
        for (position, index) in order.into_iter().enumerate() {
            cars[index].rank = position as u32 + 1;
        }
    }

    fn distance_to_next(&self, car: &CarState, track: &Track) -> f32 {
        let target = if (car.next_checkpoint as usize) < self.checkpoints.len() {
            self.checkpoints[car.next_checkpoint as usize].center()
        } else {
            self.finish.center()
        };
        track.distance(car.position, target)
    }

    /// Race is over when everyone finished, or the grace period after the
    /// first finisher ran out.
    pub fn race_complete(&self, cars: &[CarState], elapsed_ms: f64) -> bool {
        if cars.is_empty() {
            return false;
        }
        if cars.iter().all(|c| c.finished) {
            return true;
        }
        self.first_finish_at
            .is_some_and(|t| elapsed_ms - t >= FINISH_GRACE_PERIOD_MS)
    }
}

/// Elastic-with-damping car-to-car response on equal-mass bodies: separate
/// the pair, exchange momentum along the contact normal, bound the bounce
/// by `COLLISION_RESTITUTION`, and report an event per pair.
pub fn resolve_collisions(cars: &mut [CarState], events: &mut Vec<RaceEvent>) {
    for i in 0..cars.len() {
        for j in (i + 1)..cars.len() {
            if cars[i].layer != cars[j].layer {
                continue;
            }
            let delta = cars[j].position - cars[i].position;
            let dist = delta.length().max(0.1);
            if dist >= CAR_COLLISION_RADIUS * 2.0 {
                continue;
            }

            let normal = delta.scale(1.0 / dist);
            let overlap = CAR_COLLISION_RADIUS * 2.0 - dist;
            cars[i].position -= normal * (overlap / 2.0);
            cars[j].position += normal * (overlap / 2.0);

            let rel_vel = (cars[j].velocity - cars[i].velocity).dot(normal);
            let mut impulse = 0.0;
            if rel_vel < 0.0 {
                impulse = -(1.0 + COLLISION_RESTITUTION) * rel_vel / 2.0;
                cars[i].velocity -= normal * impulse;
                cars[j].velocity += normal * impulse;
                cars[i].speed = cars[i].velocity.length();
                cars[j].speed = cars[j].velocity.length();

                if impulse > DAMAGE_IMPULSE_THRESHOLD {
                    cars[i].damage = (cars[i].damage + 1).min(3);
                    cars[j].damage = (cars[j].damage + 1).min(3);
                }
            }

            events.push(RaceEvent::Collision {
                player_id: cars[i].player_id,
                other_player_id: cars[j].player_id,
                impulse: impulse.abs(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrush_core::physics;

    /// Straight drag-strip: spawn at the bottom, three checkpoints in a
    /// column, finish right behind them.
    fn strip_track() -> Track {
        let mut track = Track::default_speedway();
        track.elements.retain(|e| {
            e.kind != gridrush_core::ElementKind::Checkpoint
                && e.kind != gridrush_core::ElementKind::Finish
                && e.kind != gridrush_core::ElementKind::Spawn
        });
        let element = |id: &str, kind, x: f32, y: f32, cp: Option<u32>| TrackElement {
            id: id.to_string(),
            kind,
            x,
            y,
            width: 120.0,
            height: 20.0,
            rotation: 0.0,
            layer: None,
            checkpoint_index: cp,
            properties: None,
        };
        use gridrush_core::ElementKind::*;
        track.elements.push(element("spawn", Spawn, 180.0, 470.0, None));
        track.elements.push(element("cp-0", Checkpoint, 180.0, 440.0, Some(0)));
        track.elements.push(element("cp-1", Checkpoint, 180.0, 410.0, Some(1)));
        track.elements.push(element("cp-2", Checkpoint, 180.0, 380.0, Some(2)));
        track.elements.push(element("finish", Finish, 180.0, 350.0, None));
        track.validate().unwrap();
        track
    }

    fn race_to_events(lap_count: u32, ticks: u32) -> (Vec<RaceEvent>, Vec<CarState>) {
        let track = strip_track();
        let mut arbiter = RaceArbiter::new(&track, lap_count, false);
        let spawn = track.spawns()[0].clone();
        let mut cars = vec![CarState::at_spawn(Uuid::new_v4(), &spawn)];
        let mut inputs = HashMap::new();
        inputs.insert(
            cars[0].player_id,
            InputState {
                accelerate: true,
                ..Default::default()
            },
        );

        let mut events = Vec::new();
        for tick in 0..ticks {
            let elapsed = tick as f64 * physics::DT_MS as f64;
            for car in cars.iter_mut() {
                let input = inputs[&car.player_id];
                physics::step(car, &input);
                physics::wrap_position(car, &track);
            }
            arbiter.tick(&mut cars, &inputs, &track, elapsed, &mut events);
        }
        (events, cars)
    }

    #[test]
    fn test_checkpoints_fire_in_order_then_lap() {
        let (events, cars) = race_to_events(3, 600);

        let checkpoint_order: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                RaceEvent::Checkpoint { checkpoint, .. } => Some(*checkpoint),
                _ => None,
            })
            .collect();
        assert_eq!(checkpoint_order, vec![0, 1, 2]);

        let laps: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                RaceEvent::Lap { lap, .. } => Some(*lap),
                _ => None,
            })
            .collect();
        assert_eq!(laps, vec![1], "one pass over the strip is one lap");
        assert_eq!(cars[0].lap, 1);
    }

    #[test]
    fn test_no_lap_before_all_checkpoints() {
        let (events, _) = race_to_events(3, 600);
        let mut seen_checkpoints = 0;
        for event in &events {
            match event {
                RaceEvent::Checkpoint { .. } => seen_checkpoints += 1,
                RaceEvent::Lap { .. } => {
                    assert_eq!(seen_checkpoints, 3, "lap fired before checkpoints");
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_lap_time_sums_to_elapsed() {
        let (events, cars) = race_to_events(1, 600);
        let lap_time = events
            .iter()
            .find_map(|e| match e {
                RaceEvent::Lap { lap_time, .. } => Some(*lap_time),
                _ => None,
            })
            .expect("lap completed");
        let finish_time = cars[0].finish_time.expect("car finished");
        // Single lap: the lap time equals the race clock at completion,
        // within one tick.
        assert!((cars[0].total_lap_time() - finish_time).abs() <= physics::DT_MS as f64);
        assert!((lap_time - finish_time).abs() <= physics::DT_MS as f64);
    }

    #[test]
    fn test_finish_after_lap_count() {
        let (events, cars) = race_to_events(1, 600);
        assert!(cars[0].finished);
        assert_eq!(cars[0].rank, 1);
        assert!(events.iter().any(|e| matches!(
            e,
            RaceEvent::Finish { position: 1, .. }
        )));
    }

    #[test]
    fn test_respawn_to_spawn_before_any_checkpoint() {
        let track = strip_track();
        let arbiter = RaceArbiter::new(&track, 3, false);
        let spawn = track.spawns()[0].clone();
        let mut car = CarState::at_spawn(Uuid::new_v4(), &spawn);
        car.position = Vec2::new(700.0, 100.0);
        car.velocity = Vec2::new(8.0, 0.0);

        let input = InputState {
            respawn: true,
            ..Default::default()
        };
        let mut events = Vec::new();
        arbiter.handle_respawn(&mut car, &input, &track, 1000.0, &mut events);

        assert_eq!(car.position, car.spawn_position);
        assert_eq!(car.velocity, Vec2::ZERO);
        assert!(matches!(events[0], RaceEvent::Respawn { .. }));
    }

    #[test]
    fn test_respawn_to_last_checkpoint() {
        let track = strip_track();
        let arbiter = RaceArbiter::new(&track, 3, false);
        let spawn = track.spawns()[0].clone();
        let mut car = CarState::at_spawn(Uuid::new_v4(), &spawn);
        car.next_checkpoint = 2;
        car.position = Vec2::new(700.0, 100.0);

        let input = InputState {
            respawn: true,
            ..Default::default()
        };
        let mut events = Vec::new();
        arbiter.handle_respawn(&mut car, &input, &track, 1000.0, &mut events);

        // cp index 1 is the last fully-passed one
        assert_eq!(car.position, Vec2::new(180.0, 410.0));
        assert_eq!(car.next_checkpoint, 2, "progress is kept");
    }

    #[test]
    fn test_respawn_is_edge_triggered() {
        let track = strip_track();
        let arbiter = RaceArbiter::new(&track, 3, false);
        let spawn = track.spawns()[0].clone();
        let mut car = CarState::at_spawn(Uuid::new_v4(), &spawn);

        let held = InputState {
            respawn: true,
            ..Default::default()
        };
        let mut events = Vec::new();
        arbiter.handle_respawn(&mut car, &held, &track, 0.0, &mut events);
        arbiter.handle_respawn(&mut car, &held, &track, 16.7, &mut events);
        arbiter.handle_respawn(&mut car, &held, &track, 33.3, &mut events);
        assert_eq!(events.len(), 1, "held respawn fires once");

        let released = InputState::default();
        arbiter.handle_respawn(&mut car, &released, &track, 50.0, &mut events);
        arbiter.handle_respawn(&mut car, &held, &track, 66.7, &mut events);
        assert_eq!(events.len(), 2, "re-press fires again");
    }

    #[test]
    fn test_ranking_unfinished_by_progress() {
        let track = strip_track();
        let arbiter = RaceArbiter::new(&track, 3, false);
        let spawn = track.spawns()[0].clone();
        let mut cars = vec![
            CarState::at_spawn(Uuid::new_v4(), &spawn),
            CarState::at_spawn(Uuid::new_v4(), &spawn),
            CarState::at_spawn(Uuid::new_v4(), &spawn),
        ];
        cars[0].lap = 1;
        cars[1].lap = 2;
        cars[2].lap = 1;
        cars[2].next_checkpoint = 2;

        let mut order = Vec::new();
        arbiter.assign_ranks(&mut cars, &track);
        for car in &cars {
            order.push(car.rank);
        }
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn test_ranking_finished_before_unfinished() {
        let track = strip_track();
        let arbiter = RaceArbiter::new(&track, 3, false);
        let spawn = track.spawns()[0].clone();
        let mut cars = vec![
            CarState::at_spawn(Uuid::new_v4(), &spawn),
            CarState::at_spawn(Uuid::new_v4(), &spawn),
        ];
        cars[0].lap = 2; // far ahead but not finished
        cars[1].finished = true;
        cars[1].finish_time = Some(90_000.0);

        arbiter.assign_ranks(&mut cars, &track);
        assert_eq!(cars[1].rank, 1);
        assert_eq!(cars[0].rank, 2);
    }

    #[test]
    fn test_grace_period_ends_race() {
        let track = strip_track();
        let mut arbiter = RaceArbiter::new(&track, 3, false);
        let spawn = track.spawns()[0].clone();
        let mut cars = vec![
            CarState::at_spawn(Uuid::new_v4(), &spawn),
            CarState::at_spawn(Uuid::new_v4(), &spawn),
        ];
        cars[0].finished = true;
        cars[0].finish_time = Some(60_000.0);
        arbiter.first_finish_at = Some(60_000.0);

        assert!(!arbiter.race_complete(&cars, 60_000.0 + FINISH_GRACE_PERIOD_MS - 1.0));
        assert!(arbiter.race_complete(&cars, 60_000.0 + FINISH_GRACE_PERIOD_MS));
        cars[1].finished = true;
        assert!(arbiter.race_complete(&cars, 60_001.0));
    }

    #[test]
    fn test_collision_separates_and_bounces() {
        let track = strip_track();
        let spawn = track.spawns()[0].clone();
        let mut cars = vec![
            CarState::at_spawn(Uuid::new_v4(), &spawn),
            CarState::at_spawn(Uuid::new_v4(), &spawn),
        ];
        cars[0].position = Vec2::new(100.0, 100.0);
        cars[0].velocity = Vec2::new(10.0, 0.0);
        cars[1].position = Vec2::new(120.0, 100.0);
        cars[1].velocity = Vec2::new(-10.0, 0.0);

        let mut events = Vec::new();
        resolve_collisions(&mut cars, &mut events);

        assert!(matches!(events[0], RaceEvent::Collision { .. }));
        // Head-on pair pushed apart and bounced back
        assert!(cars[0].velocity.x < 0.0);
        assert!(cars[1].velocity.x > 0.0);
        assert!(cars[1].position.x - cars[0].position.x >= CAR_COLLISION_RADIUS * 2.0 - 0.01);
        assert_eq!(cars[0].damage, 1);
    }

    #[test]
    fn test_no_collision_across_layers() {
        let track = strip_track();
        let spawn = track.spawns()[0].clone();
        let mut cars = vec![
            CarState::at_spawn(Uuid::new_v4(), &spawn),
            CarState::at_spawn(Uuid::new_v4(), &spawn),
        ];
        cars[0].position = Vec2::new(100.0, 100.0);
        cars[1].position = Vec2::new(105.0, 100.0);
        cars[1].layer = 1; // on a bridge

        let mut events = Vec::new();
        resolve_collisions(&mut cars, &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn test_stuck_timer_arms_and_clears() {
        let track = strip_track();
        let arbiter = RaceArbiter::new(&track, 3, false);
        let spawn = track.spawns()[0].clone();
        let mut car = CarState::at_spawn(Uuid::new_v4(), &spawn);
        let mut events = Vec::new();

        arbiter.update_stuck_timer(&mut car, &track, 100.0, &mut events);
        assert_eq!(car.stuck_since, Some(100.0));

        car.position += Vec2::new(10.0, 0.0);
        arbiter.update_stuck_timer(&mut car, &track, 200.0, &mut events);
        assert_eq!(car.stuck_since, None);
        assert_eq!(car.last_position, car.position);
    }
}
