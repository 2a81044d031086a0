//! Room runtime: one tokio task per room owning the track, the car set,
//! the race arbiter and both fixed-rate loops.
//!
//! All mutation happens on the room task. External code talks to a room
//! through its `RoomHandle` inbox; snapshots and events flow out through
//! per-player bounded channels with non-blocking sends, so one slow client
//! can never stall the simulation.

use crate::arbiter::RaceArbiter;
use crate::config::GameSettings;
use crate::leaderboard::LapReport;
use crate::replay::ReplayRecording;
use gridrush_core::car::{CarState, PlayerId};
use gridrush_core::physics::{self, DT_MS};
use gridrush_core::protocol::{
    ErrorCode, PlayerInfo, RoomInfo, RoomSettings, RoomState, RoomSummary, RaceResult,
    ServerMessage,
};
use gridrush_core::snapshot::{CarSnapshot, GameSnapshot, RaceEvent};
use gridrush_core::track::Track;
use gridrush_core::InputState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Grace between the "GO" count and the racing state.
const GO_DELAY_MS: u64 = 500;
/// Disconnected players keep their seat this long.
pub const PLAYER_DISCONNECT_TIMEOUT_MS: u64 = 10_000;
/// Results screens fold back into the waiting lobby after this.
pub const RESULTS_RESET_MS: u64 = 15_000;
/// Waiting rooms with no activity are reaped after this.
pub const ROOM_IDLE_TIMEOUT_MS: u64 = 300_000;
/// Outbound per-player channel capacity; snapshots are dropped, not
/// queued, when a client falls this far behind.
pub const PLAYER_CHANNEL_CAPACITY: usize = 100;

pub enum RoomCommand {
    Join {
        session_id: PlayerId,
        nickname: String,
        color: String,
        via_code: bool,
        sender: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<Result<(), (ErrorCode, String)>>,
    },
    Leave {
        session_id: PlayerId,
    },
    SetReady {
        session_id: PlayerId,
        ready: bool,
    },
    StartGame {
        session_id: PlayerId,
        reply: oneshot::Sender<Result<(), (ErrorCode, String)>>,
    },
    Input {
        session_id: PlayerId,
        input: InputState,
    },
    Chat {
        session_id: PlayerId,
        message: String,
    },
    Emote {
        session_id: PlayerId,
        emote: String,
    },
    Disconnected {
        session_id: PlayerId,
    },
    Summary {
        reply: oneshot::Sender<RoomSummary>,
    },
    Shutdown {
        reason: String,
    },
}

#[derive(Clone)]
pub struct RoomHandle {
    pub id: String,
    pub code: String,
    pub is_private: bool,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn send(&self, cmd: RoomCommand) -> Result<(), ()> {
        self.tx.send(cmd).map_err(|_| ())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn summary(&self) -> Option<RoomSummary> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Summary { reply }).ok()?;
        rx.await.ok()
    }
}

struct RoomPlayer {
    info: PlayerInfo,
    sender: mpsc::Sender<ServerMessage>,
    disconnect_deadline: Option<Instant>,
}

pub struct Room {
    id: String,
    code: String,
    host: PlayerId,
    settings: RoomSettings,
    game_settings: GameSettings,
    track: Arc<Track>,
    state: RoomState,

    players: HashMap<PlayerId, RoomPlayer>,
    /// Join order, used for spawn assignment and host migration.
    join_order: Vec<PlayerId>,
    cars: Vec<CarState>,
    latest_inputs: HashMap<PlayerId, InputState>,

    arbiter: Option<RaceArbiter>,
    snapshot_sequence: u64,
    race_started_at: Option<Instant>,
    pending_events: Vec<RaceEvent>,
    final_results: Vec<RaceResult>,

    countdown_remaining: u32,
    go_at: Option<Instant>,
    results_reset_at: Option<Instant>,
    last_activity: Instant,
    ever_joined: bool,
    next_spawn: usize,
    lap_reports: mpsc::UnboundedSender<LapReport>,
    replays: mpsc::UnboundedSender<ReplayRecording>,
    recording: Option<ReplayRecording>,
}

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

impl Room {
    /// Spawn the room actor and return its handle.
    pub fn spawn(
        id: String,
        code: String,
        host: PlayerId,
        settings: RoomSettings,
        game_settings: GameSettings,
        track: Arc<Track>,
        closed_tx: mpsc::UnboundedSender<String>,
        lap_reports: mpsc::UnboundedSender<LapReport>,
        replays: mpsc::UnboundedSender<ReplayRecording>,
    ) -> RoomHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RoomHandle {
            id: id.clone(),
            code: code.clone(),
            is_private: settings.is_private,
            tx,
        };

        let room = Room {
            id,
            code,
            host,
            settings,
            game_settings,
            track,
            state: RoomState::Waiting,
            players: HashMap::new(),
            join_order: Vec::new(),
            cars: Vec::new(),
            latest_inputs: HashMap::new(),
            arbiter: None,
            snapshot_sequence: 0,
            race_started_at: None,
            pending_events: Vec::new(),
            final_results: Vec::new(),
            countdown_remaining: 0,
            go_at: None,
            results_reset_at: None,
            last_activity: Instant::now(),
            ever_joined: false,
            next_spawn: 0,
            lap_reports,
            replays,
            recording: None,
        };

        tokio::spawn(room.run(rx, closed_tx));
        handle
    }

    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<RoomCommand>,
        closed_tx: mpsc::UnboundedSender<String>,
    ) {
        let mut tick = interval(Duration::from_micros(1_000_000 / 60));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut broadcast = interval(Duration::from_millis(50));
        broadcast.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut countdown: Option<Interval> = None;

        info!(room = %self.id, code = %self.code, "room started");

        loop {
            tokio::select! {
                cmd = inbox.recv() => {
                    match cmd {
                        Some(RoomCommand::Shutdown { reason }) => {
                            self.broadcast(&ServerMessage::RoomLeft { reason });
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd, &mut countdown),
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    self.on_tick();
                }
                _ = broadcast.tick() => {
                    self.on_broadcast();
                }
                _ = async { countdown.as_mut().unwrap().tick().await }, if countdown.is_some() => {
                    self.on_countdown(&mut countdown);
                }
            }

            if self.should_close() {
                if !self.players.is_empty() {
                    self.broadcast(&ServerMessage::RoomLeft {
                        reason: "idle".to_string(),
                    });
                }
                info!(room = %self.id, "room closing");
                break;
            }
        }

        let _ = closed_tx.send(self.id.clone());
    }

    fn should_close(&self) -> bool {
        if self.ever_joined && self.players.is_empty() {
            return true;
        }
        self.state == RoomState::Waiting
            && self.last_activity.elapsed() >= Duration::from_millis(ROOM_IDLE_TIMEOUT_MS)
    }

    fn handle_command(&mut self, cmd: RoomCommand, countdown: &mut Option<Interval>) {
        match cmd {
            RoomCommand::Join {
                session_id,
                nickname,
                color,
                via_code,
                sender,
                reply,
            } => {
                self.last_activity = Instant::now();
                let result = self.join(session_id, nickname, color, via_code, sender);
                let _ = reply.send(result);
            }
            RoomCommand::Leave { session_id } => {
                self.last_activity = Instant::now();
                self.remove_player(session_id, "left");
            }
            RoomCommand::SetReady { session_id, ready } => {
                self.last_activity = Instant::now();
                if let Some(player) = self.players.get_mut(&session_id) {
                    player.info.ready = ready;
                    self.broadcast(&ServerMessage::PlayerReady {
                        player_id: session_id,
                        ready,
                    });
                }
            }
            RoomCommand::StartGame { session_id, reply } => {
                self.last_activity = Instant::now();
                let result = self.start_game(session_id, countdown);
                let _ = reply.send(result);
            }
            RoomCommand::Input { session_id, input } => {
                // Inputs are latched during both countdown and racing so a
                // key held before the green light takes effect on the very
                // first racing tick.
                if self.players.contains_key(&session_id)
                    && matches!(self.state, RoomState::Countdown | RoomState::Racing)
                {
                    self.latest_inputs.insert(session_id, input);
                }
            }
            RoomCommand::Chat {
                session_id,
                message,
            } => {
                if !self.settings.enable_chat {
                    return;
                }
                if let Some(player) = self.players.get(&session_id) {
                    let msg = ServerMessage::Chat {
                        player_id: session_id,
                        nickname: player.info.nickname.clone(),
                        message,
                    };
                    self.broadcast(&msg);
                }
            }
            RoomCommand::Emote { session_id, emote } => {
                if self.players.contains_key(&session_id) {
                    let msg = ServerMessage::Emote {
                        player_id: session_id,
                        emote,
                    };
                    self.broadcast_except(session_id, &msg);
                }
            }
            RoomCommand::Disconnected { session_id } => {
                if let Some(player) = self.players.get_mut(&session_id) {
                    player.info.connected = false;
                    player.disconnect_deadline = Some(
                        Instant::now() + Duration::from_millis(PLAYER_DISCONNECT_TIMEOUT_MS),
                    );
                    debug!(room = %self.id, player = %session_id, "player disconnected, eviction armed");
                }
            }
            RoomCommand::Summary { reply } => {
                let _ = reply.send(self.summary());
            }
            RoomCommand::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            code: self.code.clone(),
            player_count: self.players.len() as u32,
            max_players: self.settings.max_players,
            state: self.state,
            track_id: self.track.id.clone(),
        }
    }

    fn room_info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            code: self.code.clone(),
            host_id: self.host,
            settings: self.settings.clone(),
            state: self.state,
        }
    }

    fn player_infos(&self) -> Vec<PlayerInfo> {
        self.join_order
            .iter()
            .filter_map(|id| self.players.get(id))
            .map(|p| p.info.clone())
            .collect()
    }

    fn join(
        &mut self,
        session_id: PlayerId,
        nickname: String,
        color: String,
        via_code: bool,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<(), (ErrorCode, String)> {
        // A disconnected seat with the same nickname inside its window is
        // resumed rather than re-joined.
        if let Some(old_id) = self.find_resumable_seat(&nickname) {
            self.resume_seat(old_id, session_id, sender);
            return Ok(());
        }

        if self.settings.is_private && !via_code {
            return Err((
                ErrorCode::JoinFailed,
                "private rooms can only be joined by code".to_string(),
            ));
        }
        if self.players.len() as u32 >= self.settings.max_players {
            return Err((ErrorCode::JoinFailed, "room is full".to_string()));
        }
        let racing = matches!(self.state, RoomState::Countdown | RoomState::Racing);
        if racing && !self.settings.allow_mid_race_join {
            return Err((
                ErrorCode::JoinFailed,
                "race in progress".to_string(),
            ));
        }

        let info = PlayerInfo {
            id: session_id,
            nickname,
            color,
            ready: false,
            connected: true,
        };
        self.broadcast(&ServerMessage::PlayerJoined {
            player: info.clone(),
        });

        self.players.insert(
            session_id,
            RoomPlayer {
                info,
                sender,
                disconnect_deadline: None,
            },
        );
        self.join_order.push(session_id);
        self.ever_joined = true;

        if racing && self.settings.allow_mid_race_join {
            self.spawn_car(session_id);
        }

        let joined = ServerMessage::RoomJoined {
            room: self.room_info(),
            players: self.player_infos(),
            player_id: session_id,
        };
        self.send_to(session_id, &joined);
        info!(room = %self.id, player = %session_id, "player joined");
        Ok(())
    }

    fn find_resumable_seat(&self, nickname: &str) -> Option<PlayerId> {
        self.players
            .iter()
            .find(|(_, p)| {
                !p.info.connected
                    && p.disconnect_deadline
                        .is_some_and(|d| Instant::now() < d)
                    && p.info.nickname == nickname
            })
            .map(|(id, _)| *id)
    }

    fn resume_seat(
        &mut self,
        old_id: PlayerId,
        new_id: PlayerId,
        sender: mpsc::Sender<ServerMessage>,
    ) {
        let mut player = self.players.remove(&old_id).expect("seat exists");
        player.info.id = new_id;
        player.info.connected = true;
        player.disconnect_deadline = None;
        player.sender = sender;
        self.players.insert(new_id, player);

        for id in &mut self.join_order {
            if *id == old_id {
                *id = new_id;
            }
        }
        for car in &mut self.cars {
            if car.player_id == old_id {
                car.player_id = new_id;
            }
        }
        if let Some(input) = self.latest_inputs.remove(&old_id) {
            self.latest_inputs.insert(new_id, input);
        }
        if self.host == old_id {
            self.host = new_id;
        }

        let joined = ServerMessage::RoomJoined {
            room: self.room_info(),
            players: self.player_infos(),
            player_id: new_id,
        };
        self.send_to(new_id, &joined);
        info!(room = %self.id, old = %old_id, new = %new_id, "seat resumed");
    }

    fn remove_player(&mut self, session_id: PlayerId, reason: &str) {
        if self.players.remove(&session_id).is_none() {
            return;
        }
        self.join_order.retain(|id| *id != session_id);
        self.cars.retain(|c| c.player_id != session_id);
        self.latest_inputs.remove(&session_id);

        self.broadcast(&ServerMessage::PlayerLeft {
            player_id: session_id,
            reason: reason.to_string(),
        });

        if self.host == session_id {
            if let Some(new_host) = self.join_order.first() {
                self.host = *new_host;
                debug!(room = %self.id, host = %new_host, "host migrated");
            }
        }
    }

    fn spawn_car(&mut self, player_id: PlayerId) {
        let spawns = self.track.spawns();
        if spawns.is_empty() {
            return;
        }
        let spawn = spawns[self.next_spawn % spawns.len()];
        self.next_spawn += 1;
        self.cars.push(CarState::at_spawn(player_id, spawn));
    }

    fn start_game(
        &mut self,
        session_id: PlayerId,
        countdown: &mut Option<Interval>,
    ) -> Result<(), (ErrorCode, String)> {
        if session_id != self.host {
            return Err((
                ErrorCode::NotHost,
                "only the host can start the game".to_string(),
            ));
        }
        if self.state != RoomState::Waiting {
            return Err((
                ErrorCode::CannotStart,
                "game already running".to_string(),
            ));
        }
        let ready: Vec<PlayerId> = self
            .join_order
            .iter()
            .filter(|id| {
                self.players
                    .get(*id)
                    .map(|p| p.info.ready)
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        if (ready.len() as u32) < self.game_settings.min_players_to_start {
            return Err((
                ErrorCode::CannotStart,
                format!(
                    "need at least {} ready player(s)",
                    self.game_settings.min_players_to_start
                ),
            ));
        }

        self.cars.clear();
        self.latest_inputs.clear();
        self.next_spawn = 0;
        for player_id in ready {
            self.spawn_car(player_id);
        }

        self.arbiter = Some(RaceArbiter::new(
            &self.track,
            self.settings.lap_count,
            self.game_settings.stuck_respawn_enabled,
        ));
        self.snapshot_sequence = 0;
        self.pending_events.clear();
        self.final_results.clear();
        self.recording = None;
        self.race_started_at = None;
        self.state = RoomState::Countdown;
        self.countdown_remaining = self.game_settings.countdown_seconds;
        self.go_at = None;
        *countdown = Some(interval(Duration::from_secs(1)));

        let cars: Vec<CarSnapshot> = self.cars.iter().map(CarSnapshot::from).collect();
        let msg = ServerMessage::GameStarting {
            countdown: self.countdown_remaining,
            track: Box::new((*self.track).clone()),
            cars,
        };
        self.broadcast(&msg);
        info!(room = %self.id, "game starting");
        Ok(())
    }

    fn on_countdown(&mut self, countdown: &mut Option<Interval>) {
        if self.state != RoomState::Countdown {
            *countdown = None;
            return;
        }
        self.broadcast(&ServerMessage::Countdown {
            count: self.countdown_remaining,
        });
        if self.countdown_remaining == 0 {
            *countdown = None;
            self.go_at = Some(Instant::now() + Duration::from_millis(GO_DELAY_MS));
        } else {
            self.countdown_remaining -= 1;
        }
    }

    fn race_elapsed_ms(&self) -> f64 {
        self.race_started_at
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    fn on_tick(&mut self) {
        // Countdown hand-off: the half-second pause after "GO".
        if self.state == RoomState::Countdown {
            if let Some(go_at) = self.go_at {
                if Instant::now() >= go_at {
                    self.go_at = None;
                    self.state = RoomState::Racing;
                    self.race_started_at = Some(Instant::now());
                    self.recording = Some(ReplayRecording::new(
                        self.id.clone(),
                        self.track.id.clone(),
                        now_ms(),
                    ));
                    self.broadcast(&ServerMessage::GameStarted {
                        start_time: now_ms(),
                    });
                    info!(room = %self.id, "race started");
                }
            }
        }

        self.evict_expired();

        if self.state == RoomState::Results {
            if let Some(reset_at) = self.results_reset_at {
                if Instant::now() >= reset_at {
                    self.reset_to_waiting();
                }
            }
            return;
        }
        if self.state != RoomState::Racing {
            return;
        }

        let elapsed = self.race_elapsed_ms();
        for car in &mut self.cars {
            let input = self
                .latest_inputs
                .get(&car.player_id)
                .copied()
                .unwrap_or_default();
            physics::step(car, &input);
            physics::wrap_position(car, &self.track);
        }

        let mut events = Vec::new();
        if let Some(arbiter) = &mut self.arbiter {
            arbiter.tick(&mut self.cars, &self.latest_inputs, &self.track, elapsed, &mut events);
        }
        self.emit_event_messages(&events);
        self.pending_events.extend(events);

        let complete = self
            .arbiter
            .as_ref()
            .is_some_and(|a| a.race_complete(&self.cars, elapsed));
        if complete {
            self.finish_race(elapsed);
        }
    }

    fn emit_event_messages(&self, events: &[RaceEvent]) {
        for event in events {
            let msg = match event {
                RaceEvent::Checkpoint {
                    player_id,
                    checkpoint,
                    time,
                } => ServerMessage::CheckpointPassed {
                    player_id: *player_id,
                    checkpoint: *checkpoint,
                    time: *time,
                },
                RaceEvent::Lap {
                    player_id,
                    lap,
                    lap_time,
                } => ServerMessage::LapCompleted {
                    player_id: *player_id,
                    lap: *lap,
                    lap_time: *lap_time,
                },
                RaceEvent::Finish {
                    player_id,
                    position,
                    total_time,
                } => ServerMessage::PlayerFinished {
                    player_id: *player_id,
                    position: *position,
                    total_time: *total_time,
                },
                RaceEvent::Collision {
                    player_id,
                    other_player_id,
                    impulse,
                } => ServerMessage::Collision {
                    player_id: *player_id,
                    other_player_id: *other_player_id,
                    impulse: *impulse,
                },
                RaceEvent::Respawn { .. } => continue,
            };
            self.broadcast(&msg);
        }
    }

    fn finish_race(&mut self, elapsed: f64) {
        self.state = RoomState::Results;
        self.results_reset_at =
            Some(Instant::now() + Duration::from_millis(RESULTS_RESET_MS));

        let mut results: Vec<RaceResult> = self
            .cars
            .iter()
            .map(|car| RaceResult {
                player_id: car.player_id,
                nickname: self
                    .players
                    .get(&car.player_id)
                    .map(|p| p.info.nickname.clone())
                    .unwrap_or_default(),
                position: car.rank,
                total_time: car.finish_time,
                lap_times: car.lap_times.clone(),
                finished: car.finished,
            })
            .collect();
        results.sort_by_key(|r| r.position);
        self.final_results = results.clone();

        // Best laps go to the leaderboard recorder; the room never blocks
        // on storage.
        for car in &self.cars {
            let best = car
                .lap_times
                .iter()
                .copied()
                .fold(f64::INFINITY, f64::min);
            if best.is_finite() {
                if let Some(player) = self.players.get(&car.player_id) {
                    let _ = self.lap_reports.send(LapReport {
                        track_id: self.track.id.clone(),
                        nickname: player.info.nickname.clone(),
                        time_ms: best,
                        recorded_at: now_ms(),
                    });
                }
            }
        }

        if let Some(mut recording) = self.recording.take() {
            recording.results = results.clone();
            let _ = self.replays.send(recording);
        }

        self.broadcast(&ServerMessage::RaceFinished { results });
        info!(room = %self.id, elapsed_ms = elapsed, "race finished");
    }

    fn reset_to_waiting(&mut self) {
        self.state = RoomState::Waiting;
        self.results_reset_at = None;
        self.race_started_at = None;
        self.arbiter = None;
        self.cars.clear();
        self.latest_inputs.clear();
        self.pending_events.clear();
        self.recording = None;
        self.last_activity = Instant::now();
        for player in self.players.values_mut() {
            player.info.ready = false;
        }
        debug!(room = %self.id, "room reset to waiting");
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<PlayerId> = self
            .players
            .iter()
            .filter(|(_, p)| p.disconnect_deadline.is_some_and(|d| now >= d))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            warn!(room = %self.id, player = %id, "evicting after disconnect timeout");
            self.remove_player(id, "timeout");
        }
    }

    fn on_broadcast(&mut self) {
        if !matches!(
            self.state,
            RoomState::Countdown | RoomState::Racing | RoomState::Results
        ) {
            return;
        }
        self.snapshot_sequence += 1;
        let snapshot = GameSnapshot {
            sequence: self.snapshot_sequence,
            timestamp: now_ms(),
            game_state: self.state,
            race_time_ms: self.race_elapsed_ms(),
            cars: self.cars.iter().map(CarSnapshot::from).collect(),
            events: std::mem::take(&mut self.pending_events),
        };
        if self.state == RoomState::Racing {
            if let Some(recording) = &mut self.recording {
                recording.frames.push(snapshot.clone());
            }
        }
        self.broadcast(&ServerMessage::GameState { snapshot });
    }

    fn send_to(&self, player_id: PlayerId, msg: &ServerMessage) {
        if let Some(player) = self.players.get(&player_id) {
            if player.sender.try_send(msg.clone()).is_err() {
                debug!(room = %self.id, player = %player_id, "outbound channel full, message dropped");
            }
        }
    }

    fn broadcast(&self, msg: &ServerMessage) {
        for (id, player) in &self.players {
            if !player.info.connected {
                continue;
            }
            if player.sender.try_send(msg.clone()).is_err() {
                debug!(room = %self.id, player = %id, "outbound channel full, message dropped");
            }
        }
    }

    fn broadcast_except(&self, except: PlayerId, msg: &ServerMessage) {
        for (id, player) in &self.players {
            if *id == except || !player.info.connected {
                continue;
            }
            if player.sender.try_send(msg.clone()).is_err() {
                debug!(room = %self.id, player = %id, "outbound channel full, message dropped");
            }
        }
    }
}

/// Wall-clock helper shared with the gateway's `welcome` message.
pub fn server_time_ms() -> f64 {
    now_ms()
}

/// One physics tick expressed as wall time, used by tests pacing a room.
pub fn tick_duration() -> Duration {
    Duration::from_secs_f64(DT_MS as f64 / 1000.0)
}
