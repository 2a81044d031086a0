//! Session gateway: one TCP connection per client, length-prefixed JSON
//! messages, one reader and one writer task per session.
//!
//! The gateway validates at the boundary (nicknames, input ownership,
//! emote cooldown), converts failures into `error` messages for the
//! originator and routes everything else into the owning room's inbox. It
//! never touches room state.

use crate::manager::RoomManager;
use crate::room::{server_time_ms, RoomCommand, RoomHandle, PLAYER_CHANNEL_CAPACITY};
use crate::storage::TrackStore;
use gridrush_core::car::PlayerId;
use gridrush_core::protocol::{
    decode_client_message, ClientMessage, ErrorCode, ServerMessage, TrackSummary,
    MAX_MESSAGE_BYTES,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const EMOTE_COOLDOWN_MS: u64 = 1_500;
const NICKNAME_MIN: usize = 2;
const NICKNAME_MAX: usize = 16;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub fn valid_nickname(nickname: &str) -> bool {
    let len = nickname.chars().count();
    (NICKNAME_MIN..=NICKNAME_MAX).contains(&len)
        && nickname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Read one length-prefixed frame. Returns `None` on a clean EOF at a
/// frame boundary.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, GatewayError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(GatewayError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub(crate) async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<(), GatewayError>
where
    W: AsyncWrite + Unpin,
{
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

pub struct Gateway {
    manager: Arc<RoomManager>,
    tracks: Arc<TrackStore>,
}

impl Gateway {
    pub fn new(manager: Arc<RoomManager>, tracks: Arc<TrackStore>) -> Arc<Self> {
        Arc::new(Self { manager, tracks })
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        info!("gateway listening on {:?}", listener.local_addr().ok());
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("new connection from {}", addr);
                    let gateway = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_connection(stream).await {
                            debug!("connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), GatewayError> {
        stream.set_nodelay(true).ok();
        let (mut reader, mut writer) = tokio::io::split(stream);

        let session_id: PlayerId = Uuid::new_v4();
        let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(PLAYER_CHANNEL_CAPACITY);

        // Writer task: drains the session's outbound queue.
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match serde_json::to_vec(&msg) {
                    Ok(data) => {
                        if write_frame(&mut writer, &data).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("failed to serialize server message: {}", e);
                        break;
                    }
                }
            }
        });

        let mut session = Session {
            id: session_id,
            room: None,
            last_emote_at: None,
            out_tx: out_tx.clone(),
        };
        session
            .send(ServerMessage::Welcome {
                player_id: session_id,
                server_time: server_time_ms(),
            })
            .await;

        // Reader loop runs on this task.
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!(session = %session_id, "read failed: {}", e);
                    break;
                }
            };
            let msg = match decode_client_message(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(session = %session_id, "rejected message: {}", e);
                    continue;
                }
            };
            self.dispatch(&mut session, msg).await;
        }

        // Disconnect: the room keeps the seat for the reconnect window,
        // but this session id is gone for good.
        if let Some(room) = &session.room {
            let _ = room.send(RoomCommand::Disconnected {
                session_id: session.id,
            });
        }
        self.manager.clear_session(session.id).await;
        drop(out_tx);
        writer_task.abort();
        info!(session = %session_id, "session closed");
        Ok(())
    }

    async fn dispatch(&self, session: &mut Session, msg: ClientMessage) {
        match msg {
            ClientMessage::CreateRoom {
                settings,
                nickname,
                preferred_color,
            } => {
                if !valid_nickname(&nickname) {
                    session.error(ErrorCode::InvalidNickname, "nickname must be 2-16 chars of [A-Za-z0-9_-]").await;
                    return;
                }
                let handle = match self.manager.create_room(session.id, settings).await {
                    Ok(handle) => handle,
                    Err((code, message)) => {
                        session.error(code, &message).await;
                        return;
                    }
                };
                self.join_room(session, handle, nickname, preferred_color, true)
                    .await;
            }

            ClientMessage::JoinRoom {
                room_id,
                code,
                nickname,
                preferred_color,
            } => {
                if !valid_nickname(&nickname) {
                    session.error(ErrorCode::InvalidNickname, "nickname must be 2-16 chars of [A-Za-z0-9_-]").await;
                    return;
                }
                let reference = match code.or(room_id) {
                    Some(reference) => reference,
                    None => {
                        session
                            .error(ErrorCode::JoinFailed, "missing room id or code")
                            .await;
                        return;
                    }
                };
                match self.manager.find_room(&reference).await {
                    Some((handle, via_code)) => {
                        self.join_room(session, handle, nickname, preferred_color, via_code)
                            .await;
                    }
                    None => {
                        session
                            .error(ErrorCode::JoinFailed, "unknown room id or code")
                            .await;
                    }
                }
            }

            ClientMessage::LeaveRoom => {
                if let Some(room) = session.room.take() {
                    let _ = room.send(RoomCommand::Leave {
                        session_id: session.id,
                    });
                    self.manager.clear_session(session.id).await;
                    session
                        .send(ServerMessage::RoomLeft {
                            reason: "left".to_string(),
                        })
                        .await;
                } else {
                    session.error(ErrorCode::NoRoom, "not in a room").await;
                }
            }

            ClientMessage::SetReady { ready } => {
                session
                    .route(RoomCommand::SetReady {
                        session_id: session.id,
                        ready,
                    })
                    .await;
            }

            ClientMessage::StartGame => {
                let Some(room) = session.room.clone() else {
                    session.error(ErrorCode::NoRoom, "not in a room").await;
                    return;
                };
                let (reply, rx) = oneshot::channel();
                if room
                    .send(RoomCommand::StartGame {
                        session_id: session.id,
                        reply,
                    })
                    .is_err()
                {
                    self.room_lost(session).await;
                    return;
                }
                if let Ok(Err((code, message))) = rx.await {
                    session.error(code, &message).await;
                }
            }

            ClientMessage::Input {
                player_id,
                sequence,
                timestamp,
                accelerate,
                brake,
                steer_left,
                steer_right,
                steer_value,
                nitro,
                handbrake,
                respawn,
            } => {
                if player_id != session.id {
                    // Inputs only drive the sender's own car.
                    debug!(session = %session.id, "dropping input for foreign player {}", player_id);
                    return;
                }
                let mut input = gridrush_core::InputState {
                    sequence,
                    timestamp,
                    accelerate,
                    brake,
                    steer_left,
                    steer_right,
                    steer_value,
                    nitro,
                    handbrake,
                    respawn,
                };
                input.sanitize();
                session
                    .route(RoomCommand::Input {
                        session_id: session.id,
                        input,
                    })
                    .await;
            }

            ClientMessage::Chat { message } => {
                if message.is_empty() || message.chars().count() > 200 {
                    return;
                }
                session
                    .route(RoomCommand::Chat {
                        session_id: session.id,
                        message,
                    })
                    .await;
            }

            ClientMessage::Emote { emote } => {
                let now = Instant::now();
                let blocked = session.last_emote_at.is_some_and(|t| {
                    now.duration_since(t) < Duration::from_millis(EMOTE_COOLDOWN_MS)
                });
                if blocked {
                    return;
                }
                session.last_emote_at = Some(now);
                session
                    .route(RoomCommand::Emote {
                        session_id: session.id,
                        emote,
                    })
                    .await;
            }

            ClientMessage::RequestRoomList => {
                let rooms = self.manager.room_summaries().await;
                session.send(ServerMessage::RoomList { rooms }).await;
            }

            ClientMessage::RequestTrackList => {
                let tracks = self
                    .tracks
                    .list()
                    .await
                    .iter()
                    .map(|t| track_summary(t))
                    .collect();
                session.send(ServerMessage::TrackList { tracks }).await;
            }

            ClientMessage::Ping { timestamp } => {
                session
                    .send(ServerMessage::Pong {
                        client_timestamp: timestamp,
                        server_timestamp: server_time_ms(),
                    })
                    .await;
            }
        }
    }

    async fn join_room(
        &self,
        session: &mut Session,
        handle: RoomHandle,
        nickname: String,
        preferred_color: Option<String>,
        via_code: bool,
    ) {
        let (reply, rx) = oneshot::channel();
        let cmd = RoomCommand::Join {
            session_id: session.id,
            nickname,
            color: preferred_color.unwrap_or_else(|| "#e23b3b".to_string()),
            via_code,
            sender: session.out_tx.clone(),
            reply,
        };
        if handle.send(cmd).is_err() {
            session
                .error(ErrorCode::JoinFailed, "room no longer exists")
                .await;
            return;
        }
        match rx.await {
            Ok(Ok(())) => {
                self.manager
                    .set_session_room(session.id, handle.id.clone())
                    .await;
                session.room = Some(handle);
            }
            Ok(Err((code, message))) => {
                session.error(code, &message).await;
            }
            Err(_) => {
                session
                    .error(ErrorCode::JoinFailed, "room no longer exists")
                    .await;
            }
        }
    }

    /// The room task died under this session; tell the client and detach.
    async fn room_lost(&self, session: &mut Session) {
        session.room = None;
        self.manager.clear_session(session.id).await;
        session
            .send(ServerMessage::RoomLeft {
                reason: "crash".to_string(),
            })
            .await;
    }
}

struct Session {
    id: PlayerId,
    room: Option<RoomHandle>,
    last_emote_at: Option<Instant>,
    out_tx: mpsc::Sender<ServerMessage>,
}

impl Session {
    async fn send(&self, msg: ServerMessage) {
        let _ = self.out_tx.send(msg).await;
    }

    async fn error(&self, code: ErrorCode, message: &str) {
        self.send(ServerMessage::Error {
            code,
            message: message.to_string(),
        })
        .await;
    }

    /// Forward a command to the session's room, reporting `NO_ROOM` or a
    /// dead room to the client.
    async fn route(&mut self, cmd: RoomCommand) {
        match self.room.clone() {
            Some(room) => {
                if room.send(cmd).is_err() {
                    self.room = None;
                    self.send(ServerMessage::RoomLeft {
                        reason: "crash".to_string(),
                    })
                    .await;
                }
            }
            None => {
                if !matches!(cmd, RoomCommand::Input { .. }) {
                    self.error(ErrorCode::NoRoom, "not in a room").await;
                }
            }
        }
    }
}

pub fn track_summary(track: &gridrush_core::Track) -> TrackSummary {
    TrackSummary {
        id: track.id.clone(),
        name: track.name.clone(),
        author: track.author.clone(),
        difficulty: track.difficulty,
        default_lap_count: track.default_lap_count,
    }
}
