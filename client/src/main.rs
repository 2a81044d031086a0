mod config;
mod net;
mod predictor;
mod view;

use anyhow::{Context, Result};
use clap::Parser;
use config::ClientConfig;
use console::{Key, Term};
use dialoguer::{Input, Select};
use gridrush_core::car::{CarState, PlayerId};
use gridrush_core::math::Vec2;
use gridrush_core::protocol::{ClientMessage, ServerMessage};
use gridrush_core::track::Track;
use gridrush_core::InputState;
use net::NetworkClient;
use predictor::Predictor;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{info, warn};
use view::ClientStore;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address, e.g. 127.0.0.1:3000
    #[arg(short, long)]
    server: Option<String>,

    /// Nickname (2-16 chars of [A-Za-z0-9_-])
    #[arg(short, long)]
    nickname: Option<String>,

    /// Path to client.toml configuration file
    #[arg(short, long, default_value = "./client.toml")]
    config: String,
}

fn wall_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Toggle-based driving state; a terminal cannot report key releases, so
/// keys flip the held flags instead.
#[derive(Debug, Default, Clone, Copy)]
struct HeldKeys {
    accelerate: bool,
    brake: bool,
    steer_left: bool,
    steer_right: bool,
    nitro: bool,
    respawn_once: bool,
    quit: bool,
}

impl HeldKeys {
    fn apply(&mut self, key: &Key) {
        match key {
            Key::Char('w') | Key::ArrowUp => self.accelerate = !self.accelerate,
            Key::Char('s') | Key::ArrowDown => self.brake = !self.brake,
            Key::Char('a') | Key::ArrowLeft => {
                self.steer_left = !self.steer_left;
                self.steer_right = false;
            }
            Key::Char('d') | Key::ArrowRight => {
                self.steer_right = !self.steer_right;
                self.steer_left = false;
            }
            Key::Char('n') => self.nitro = !self.nitro,
            Key::Char('r') => self.respawn_once = true,
            Key::Char('q') | Key::Escape => self.quit = true,
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let config = ClientConfig::load_or_default(&args.config);
    let server_addr = args
        .server
        .unwrap_or(config.server_addr)
        .parse()
        .context("invalid server address")?;
    let nickname = args.nickname.unwrap_or(config.nickname);

    let mut client = NetworkClient::new(server_addr);
    client.connect().await?;

    let player_id = match client.receive().await? {
        ServerMessage::Welcome { player_id, .. } => player_id,
        other => anyhow::bail!("expected welcome, got {:?}", other),
    };
    info!("Connected as {}", player_id);

    let action = Select::new()
        .with_prompt("GridRush")
        .items(&["Create room", "Join room by code", "List rooms", "Quit"])
        .default(0)
        .interact()?;

    match action {
        0 => {
            client
                .send(&ClientMessage::CreateRoom {
                    settings: Default::default(),
                    nickname: nickname.clone(),
                    preferred_color: Some(config.preferred_color.clone()),
                })
                .await?;
        }
        1 => {
            let code: String = Input::new().with_prompt("Room code").interact_text()?;
            client
                .send(&ClientMessage::JoinRoom {
                    room_id: None,
                    code: Some(code.trim().to_uppercase()),
                    nickname: nickname.clone(),
                    preferred_color: Some(config.preferred_color.clone()),
                })
                .await?;
        }
        2 => {
            client.send(&ClientMessage::RequestRoomList).await?;
            if let ServerMessage::RoomList { rooms } = client.receive().await? {
                for room in &rooms {
                    println!(
                        "{}  {}/{} players  [{:?}]",
                        room.code, room.player_count, room.max_players, room.state
                    );
                }
                if rooms.is_empty() {
                    println!("No open rooms.");
                }
            }
            return Ok(());
        }
        _ => return Ok(()),
    }

    // Wait for the join confirmation, surfacing server-side errors.
    let (room, am_host) = loop {
        match client.receive().await? {
            ServerMessage::RoomJoined { room, .. } => {
                let am_host = room.host_id == player_id;
                break (room, am_host);
            }
            ServerMessage::Error { code, message } => {
                anyhow::bail!("server rejected us: {:?} {}", code, message);
            }
            _ => {}
        }
    };
    println!("Joined room {} (code {})", room.id, room.code);

    client.send(&ClientMessage::SetReady { ready: true }).await?;
    if am_host {
        let _: String = Input::new()
            .with_prompt("Press enter to start the race")
            .allow_empty(true)
            .interact_text()?;
        client.send(&ClientMessage::StartGame).await?;
    } else {
        println!("Waiting for the host to start...");
    }

    // Pre-race: wait for the track and the green light.
    let mut track: Option<Track> = None;
    let mut my_car: Option<CarState> = None;
    loop {
        match client.receive().await? {
            ServerMessage::GameStarting {
                track: race_track,
                cars,
                ..
            } => {
                for snap in &cars {
                    if snap.player_id == player_id {
                        let spawn_rotation = snap.rotation;
                        let mut car = CarState::at_spawn(
                            player_id,
                            race_track.spawns().first().copied().context("track has no spawn")?,
                        );
                        car.position = snap.position();
                        car.rotation = spawn_rotation;
                        car.spawn_position = car.position;
                        car.spawn_rotation = spawn_rotation;
                        my_car = Some(car);
                    }
                }
                track = Some(*race_track);
            }
            ServerMessage::Countdown { count } => {
                if count == 0 {
                    println!("GO!");
                } else {
                    println!("{}...", count);
                }
            }
            ServerMessage::GameStarted { .. } => break,
            ServerMessage::Error { code, message } => {
                warn!("server error: {:?} {}", code, message);
            }
            _ => {}
        }
    }

    let track = track.context("race started without a track")?;
    let my_car = my_car.context("race started without our car")?;
    race_loop(&mut client, player_id, track, my_car).await?;

    client.send(&ClientMessage::LeaveRoom).await.ok();
    client.disconnect().await.ok();
    Ok(())
}

async fn race_loop(
    client: &mut NetworkClient,
    player_id: PlayerId,
    track: Track,
    my_car: CarState,
) -> Result<()> {
    println!("Controls: w/s throttle/brake, a/d steer (toggles), n nitro, r respawn, q quit");

    let mut predictor = Predictor::new(my_car, &track);
    let mut store = ClientStore::new(player_id);
    if track.wrap_around {
        store.set_track_size(Some(Vec2::new(track.width as f32, track.height as f32)));
    }

    // Terminal keys arrive on a dedicated blocking thread.
    let (key_tx, mut key_rx) = mpsc::unbounded_channel::<Key>();
    std::thread::spawn(move || {
        let term = Term::stdout();
        while let Ok(key) = term.read_key() {
            if key_tx.send(key).is_err() {
                break;
            }
        }
    });

    let mut keys = HeldKeys::default();
    let mut sequence: u32 = 0;
    let mut last_input = InputState::default();
    let mut last_frame = Instant::now();
    let mut last_ping = Instant::now();
    let mut last_hud = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / 60));

    loop {
        ticker.tick().await;

        while let Ok(key) = key_rx.try_recv() {
            keys.apply(&key);
        }
        if keys.quit {
            break;
        }

        sequence += 1;
        let input = InputState {
            sequence,
            timestamp: wall_ms(),
            accelerate: keys.accelerate,
            brake: keys.brake,
            steer_left: keys.steer_left,
            steer_right: keys.steer_right,
            nitro: keys.nitro,
            handbrake: false,
            respawn: keys.respawn_once,
            steer_value: 0.0,
        };
        keys.respawn_once = false;

        client
            .send(&ClientMessage::Input {
                player_id,
                sequence: input.sequence,
                timestamp: input.timestamp,
                accelerate: input.accelerate,
                brake: input.brake,
                steer_left: input.steer_left,
                steer_right: input.steer_right,
                steer_value: input.steer_value,
                nitro: input.nitro,
                handbrake: input.handbrake,
                respawn: input.respawn,
            })
            .await?;

        // New input events apply immediately; otherwise the accumulator
        // keeps the prediction at a steady 60 Hz.
        let now = Instant::now();
        let frame_dt = now.duration_since(last_frame).as_secs_f32();
        last_frame = now;
        let is_event = {
            let mut a = input;
            let mut b = last_input;
            a.sequence = 0;
            a.timestamp = 0.0;
            b.sequence = 0;
            b.timestamp = 0.0;
            a != b
        };
        if is_event {
            predictor.apply_input(input);
        } else {
            predictor.advance(frame_dt);
        }
        last_input = input;

        if last_ping.elapsed() >= Duration::from_secs(3) {
            last_ping = Instant::now();
            client
                .send(&ClientMessage::Ping {
                    timestamp: wall_ms(),
                })
                .await?;
        }

        // Drain whatever the server pushed since the last tick.
        while let Some(msg) = client.try_receive(Duration::from_millis(1)).await? {
            match msg {
                ServerMessage::GameState { snapshot } => {
                    store.apply_snapshot(&snapshot);
                    if store.take_local_respawn() {
                        predictor.handle_respawn();
                    }
                    if let Some(snap) = snapshot.cars.iter().find(|c| c.player_id == player_id) {
                        predictor.reconcile(snap);
                    }
                }
                ServerMessage::Pong {
                    client_timestamp, ..
                } => {
                    store.record_rtt(wall_ms() - client_timestamp);
                }
                ServerMessage::LapCompleted {
                    player_id: who,
                    lap,
                    lap_time,
                } if who == player_id => {
                    println!("Lap {} in {:.2}s", lap, lap_time / 1000.0);
                }
                ServerMessage::RaceFinished { results } => {
                    println!("--- Race finished ---");
                    for result in results {
                        let time = result
                            .total_time
                            .map(|t| format!("{:.2}s", t / 1000.0))
                            .unwrap_or_else(|| "DNF".to_string());
                        println!("{}. {} {}", result.position, result.nickname, time);
                    }
                    return Ok(());
                }
                ServerMessage::RoomLeft { reason } => {
                    println!("Left room: {}", reason);
                    return Ok(());
                }
                _ => {}
            }
        }

        store.animate(frame_dt);

        if last_hud.elapsed() >= Duration::from_secs(1) {
            last_hud = Instant::now();
            let car = predictor.car();
            println!(
                "lap {} | rank {}/{} | speed {:5.1} | nitro {:3.0} | rtt {:4.0}ms | corr {:5.1}px | pos ({:.0},{:.0})",
                store.hud.lap,
                store.hud.rank,
                store.hud.total_players,
                car.speed,
                car.nitro,
                store.hud.rtt_ms,
                predictor.last_correction_dist(),
                car.position.x,
                car.position.y,
            );
        }
    }

    Ok(())
}
