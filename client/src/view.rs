//! Remote-car interpolation and the HUD-facing client state store.
//!
//! Remote cars are drawn at a display position that chases the latest
//! snapshot target; only jumps beyond the teleport threshold snap. The
//! local player's car never goes through this path, its display is driven
//! directly by the predictor.

use gridrush_core::car::PlayerId;
use gridrush_core::math::{lerp_angle, unwrap_toward, Vec2};
use gridrush_core::protocol::RoomState;
use gridrush_core::snapshot::{CarSnapshot, GameSnapshot, RaceEvent};
use std::collections::HashMap;
use tracing::warn;

/// Remote jumps beyond this snap the display instead of gliding.
pub const TELEPORT_THRESHOLD: f32 = 200.0;
/// Safety clamp for display coordinates; nothing legitimate gets here.
const WORLD_BOUND: f32 = 1.0e7;

const POSITION_LERP: f32 = 0.2;
const ROTATION_LERP: f32 = 0.3;

#[derive(Debug, Clone)]
pub struct RemoteCar {
    pub target_position: Vec2,
    pub target_rotation: f32,
    pub display_position: Vec2,
    pub display_rotation: f32,
    pub speed: f32,
    pub lap: u32,
    pub rank: u32,
    pub finished: bool,
    pub layer: i8,
}

impl RemoteCar {
    fn new(snap: &CarSnapshot) -> Self {
        Self {
            target_position: snap.position(),
            target_rotation: snap.rotation,
            display_position: snap.position(),
            display_rotation: snap.rotation,
            speed: snap.speed,
            lap: snap.lap,
            rank: snap.position_rank,
            finished: snap.finished,
            layer: snap.layer,
        }
    }

    /// Retarget from a snapshot, unwrapping into the display's frame on
    /// wrap-around tracks and snapping across teleports.
    fn retarget(&mut self, snap: &CarSnapshot, track_size: Option<Vec2>) {
        let mut target = snap.position();
        if let Some(size) = track_size {
            target.x = unwrap_toward(target.x, self.display_position.x, size.x);
            target.y = unwrap_toward(target.y, self.display_position.y, size.y);
        }

        if self.display_position.distance(target) > TELEPORT_THRESHOLD {
            self.display_position = target;
            self.display_rotation = snap.rotation;
        }
        self.target_position = target;
        self.target_rotation = snap.rotation;
        self.speed = snap.speed;
        self.lap = snap.lap;
        self.rank = snap.position_rank;
        self.finished = snap.finished;
        self.layer = snap.layer;
    }

    /// Glide the display toward the target; factors are per-60Hz-frame and
    /// scale with the real frame time, capped so long frames cannot
    /// overshoot.
    fn animate(&mut self, dt_secs: f32) {
        let position_t = (POSITION_LERP * dt_secs * 60.0).min(1.0);
        let rotation_t = (ROTATION_LERP * dt_secs * 60.0).min(1.0);

        let next = self.display_position.lerp(self.target_position, position_t);
        if next.is_finite() {
            self.display_position = Vec2::new(
                next.x.clamp(-WORLD_BOUND, WORLD_BOUND),
                next.y.clamp(-WORLD_BOUND, WORLD_BOUND),
            );
        } else {
            warn!("non-finite display position, snapping to target");
            self.display_position = self.target_position;
        }
        self.display_rotation = lerp_angle(self.display_rotation, self.target_rotation, rotation_t);
        if !self.display_rotation.is_finite() {
            self.display_rotation = self.target_rotation;
        }
    }
}

/// Derived state for the HUD: the local player's race line plus the
/// interpolated remote field.
#[derive(Debug, Default, Clone)]
pub struct HudState {
    pub lap: u32,
    pub rank: u32,
    pub total_players: u32,
    pub speed: f32,
    pub nitro: u32,
    pub lap_times: Vec<f64>,
    pub finished: bool,
    pub race_time_ms: f64,
    pub rtt_ms: f64,
}

pub struct ClientStore {
    local_player: PlayerId,
    remotes: HashMap<PlayerId, RemoteCar>,
    track_size: Option<Vec2>,
    pub hud: HudState,
    pub game_state: Option<RoomState>,
    last_sequence: u64,
    /// Respawn observed for the local player in the latest snapshot; the
    /// caller forwards it to the predictor.
    pub local_respawn_pending: bool,
}

impl ClientStore {
    pub fn new(local_player: PlayerId) -> Self {
        Self {
            local_player,
            remotes: HashMap::new(),
            track_size: None,
            hud: HudState::default(),
            game_state: None,
            last_sequence: 0,
            local_respawn_pending: false,
        }
    }

    /// Track bounds drive remote-frame unwrapping; call when the race
    /// starts. `None` for non-wrapping tracks.
    pub fn set_track_size(&mut self, size: Option<Vec2>) {
        self.track_size = size;
    }

    pub fn remotes(&self) -> impl Iterator<Item = (&PlayerId, &RemoteCar)> {
        self.remotes.iter()
    }

    pub fn record_rtt(&mut self, sample_ms: f64) {
        if self.hud.rtt_ms == 0.0 {
            self.hud.rtt_ms = sample_ms;
        } else {
            // Exponential smoothing keeps the overlay readable.
            self.hud.rtt_ms += (sample_ms - self.hud.rtt_ms) * 0.2;
        }
    }

    /// Ingest a snapshot: retarget remotes, refresh the HUD from the local
    /// car record, surface local respawn events. Stale snapshots (readers
    /// can outrun the network buffer) are dropped.
    pub fn apply_snapshot(&mut self, snapshot: &GameSnapshot) {
        if snapshot.sequence <= self.last_sequence {
            return;
        }
        self.last_sequence = snapshot.sequence;
        self.game_state = Some(snapshot.game_state);
        self.hud.race_time_ms = snapshot.race_time_ms;
        self.hud.total_players = snapshot.cars.len() as u32;

        for car in &snapshot.cars {
            if car.player_id == self.local_player {
                self.hud.lap = car.lap;
                self.hud.rank = car.position_rank;
                self.hud.speed = car.speed;
                self.hud.nitro = car.nitro;
                self.hud.finished = car.finished;
                continue;
            }
            match self.remotes.get_mut(&car.player_id) {
                Some(remote) => remote.retarget(car, self.track_size),
                None => {
                    self.remotes.insert(car.player_id, RemoteCar::new(car));
                }
            }
        }
        self.remotes
            .retain(|id, _| snapshot.cars.iter().any(|c| c.player_id == *id));

        for event in &snapshot.events {
            match event {
                RaceEvent::Respawn { player_id } if *player_id == self.local_player => {
                    self.local_respawn_pending = true;
                }
                RaceEvent::Lap { player_id, lap_time, .. }
                    if *player_id == self.local_player =>
                {
                    self.hud.lap_times.push(*lap_time);
                }
                _ => {}
            }
        }
    }

    /// Per render frame: glide every remote display toward its target.
    pub fn animate(&mut self, dt_secs: f32) {
        for remote in self.remotes.values_mut() {
            remote.animate(dt_secs);
        }
    }

    /// Consume the pending local respawn flag.
    pub fn take_local_respawn(&mut self) -> bool {
        std::mem::take(&mut self.local_respawn_pending)
    }
}
