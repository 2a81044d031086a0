//! Wire protocol between client and server.
//!
//! Messages are JSON records tagged by `type` with flat camelCase fields,
//! matching the shape existing clients already speak. Transport framing
//! (4-byte big-endian length prefix) lives with the transport code on each
//! side; this module only defines the records and the decode guards.

use crate::car::PlayerId;
use crate::snapshot::{CarSnapshot, GameSnapshot};
use crate::track::Track;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded message size accepted on either side.
pub const MAX_MESSAGE_BYTES: usize = 1_000_000;

/// Legacy field aliases that older clients used on input records. They are
/// no longer part of the wire; a message carrying one is rejected outright
/// instead of being silently merged with the canonical fields.
const LEGACY_INPUT_ALIASES: [&str; 3] = ["turnLeft", "turnRight", "boost"];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("legacy input alias `{0}` is no longer accepted")]
    LegacyAlias(String),
    #[error("message exceeds {MAX_MESSAGE_BYTES} bytes")]
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Waiting,
    Countdown,
    Racing,
    Results,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidNickname,
    NoRoom,
    JoinFailed,
    NotHost,
    CannotStart,
    CreateFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default = "default_lap_count")]
    pub lap_count: u32,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default = "default_true")]
    pub allow_mid_race_join: bool,
    #[serde(default = "default_true")]
    pub enable_chat: bool,
    #[serde(default)]
    pub track_id: Option<String>,
}

fn default_max_players() -> u32 {
    8
}
fn default_lap_count() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_players: default_max_players(),
            lap_count: default_lap_count(),
            is_private: false,
            allow_mid_race_join: true,
            enable_chat: true,
            track_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub nickname: String,
    pub color: String,
    pub ready: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: String,
    pub code: String,
    pub host_id: PlayerId,
    pub settings: RoomSettings,
    pub state: RoomState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub code: String,
    pub player_count: u32,
    pub max_players: u32,
    pub state: RoomState,
    pub track_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub id: String,
    pub name: String,
    pub author: String,
    pub difficulty: crate::track::Difficulty,
    pub default_lap_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceResult {
    pub player_id: PlayerId,
    pub nickname: String,
    pub position: u32,
    pub total_time: Option<f64>,
    pub lap_times: Vec<f64>,
    pub finished: bool,
}

// --- Client to Server Messages ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        #[serde(default)]
        settings: RoomSettings,
        nickname: String,
        #[serde(default)]
        preferred_color: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        code: Option<String>,
        nickname: String,
        #[serde(default)]
        preferred_color: Option<String>,
    },
    LeaveRoom,
    SetReady {
        ready: bool,
    },
    StartGame,
    #[serde(rename_all = "camelCase")]
    Input {
        player_id: PlayerId,
        sequence: u32,
        timestamp: f64,
        #[serde(default)]
        accelerate: bool,
        #[serde(default)]
        brake: bool,
        #[serde(default)]
        steer_left: bool,
        #[serde(default)]
        steer_right: bool,
        #[serde(default)]
        steer_value: f32,
        #[serde(default)]
        nitro: bool,
        #[serde(default)]
        handbrake: bool,
        #[serde(default)]
        respawn: bool,
    },
    Chat {
        message: String,
    },
    Emote {
        emote: String,
    },
    RequestRoomList,
    RequestTrackList,
    Ping {
        timestamp: f64,
    },
}

// --- Server to Client Messages ---
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome {
        player_id: PlayerId,
        server_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room: RoomInfo,
        players: Vec<PlayerInfo>,
        player_id: PlayerId,
    },
    RoomLeft {
        reason: String,
    },
    PlayerJoined {
        player: PlayerInfo,
    },
    #[serde(rename_all = "camelCase")]
    PlayerLeft {
        player_id: PlayerId,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    PlayerReady {
        player_id: PlayerId,
        ready: bool,
    },
    GameStarting {
        countdown: u32,
        track: Box<Track>,
        cars: Vec<CarSnapshot>,
    },
    Countdown {
        count: u32,
    },
    #[serde(rename_all = "camelCase")]
    GameStarted {
        start_time: f64,
    },
    GameState {
        snapshot: GameSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    CheckpointPassed {
        player_id: PlayerId,
        checkpoint: u32,
        time: f64,
    },
    #[serde(rename_all = "camelCase")]
    LapCompleted {
        player_id: PlayerId,
        lap: u32,
        lap_time: f64,
    },
    #[serde(rename_all = "camelCase")]
    PlayerFinished {
        player_id: PlayerId,
        position: u32,
        total_time: f64,
    },
    RaceFinished {
        results: Vec<RaceResult>,
    },
    #[serde(rename_all = "camelCase")]
    Collision {
        player_id: PlayerId,
        other_player_id: PlayerId,
        impulse: f32,
    },
    #[serde(rename_all = "camelCase")]
    Chat {
        player_id: PlayerId,
        nickname: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Emote {
        player_id: PlayerId,
        emote: String,
    },
    RoomList {
        rooms: Vec<RoomSummary>,
    },
    TrackList {
        tracks: Vec<TrackSummary>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Pong {
        client_timestamp: f64,
        server_timestamp: f64,
    },
}

/// Decode a client message, rejecting oversized payloads and the retired
/// input-field aliases.
pub fn decode_client_message(bytes: &[u8]) -> Result<ClientMessage, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge);
    }
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if value.get("type").and_then(|t| t.as_str()) == Some("input") {
        if let Some(obj) = value.as_object() {
            for alias in LEGACY_INPUT_ALIASES {
                if obj.contains_key(alias) {
                    return Err(ProtocolError::LegacyAlias(alias.to_string()));
                }
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

pub fn decode_server_message(bytes: &[u8]) -> Result<ServerMessage, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge);
    }
    Ok(serde_json::from_slice(bytes)?)
}

impl ClientMessage {
    /// Extract the canonical input record from an `input` message.
    pub fn as_input(&self) -> Option<crate::car::InputState> {
        match self {
            ClientMessage::Input {
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
                ..
            } => {
                let mut input = crate::car::InputState {
                    sequence: *sequence,
                    timestamp: *timestamp,
                    accelerate: *accelerate,
                    brake: *brake,
                    steer_left: *steer_left,
                    steer_right: *steer_right,
                    steer_value: *steer_value,
                    nitro: *nitro,
                    handbrake: *handbrake,
                    respawn: *respawn,
                };
                input.sanitize();
                Some(input)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_client_message_wire_shape() {
        let msg = ClientMessage::SetReady { ready: true };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"set_ready","ready":true}"#);

        let msg = ClientMessage::LeaveRoom;
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"leave_room"}"#);
    }

    #[test]
    fn test_input_message_roundtrip() {
        let raw = r#"{
            "type": "input",
            "playerId": "6f2b4e4e-8b1a-4c62-9d2f-2a1f0f6f3a11",
            "sequence": 42,
            "timestamp": 1234.5,
            "accelerate": true,
            "steerLeft": true,
            "steerValue": -0.5,
            "nitro": false
        }"#;
        let msg = decode_client_message(raw.as_bytes()).unwrap();
        let input = msg.as_input().unwrap();
        assert_eq!(input.sequence, 42);
        assert!(input.accelerate);
        assert!(input.steer_left);
        assert_eq!(input.steer_value, -0.5);
        assert!(!input.respawn);
    }

    #[test]
    fn test_legacy_aliases_rejected() {
        let raw = r#"{
            "type": "input",
            "playerId": "6f2b4e4e-8b1a-4c62-9d2f-2a1f0f6f3a11",
            "sequence": 1,
            "timestamp": 0,
            "boost": true
        }"#;
        let err = decode_client_message(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, ProtocolError::LegacyAlias(a) if a == "boost"));
    }

    #[test]
    fn test_create_room_defaults() {
        let raw = r#"{"type":"create_room","nickname":"Racer_1"}"#;
        let msg = decode_client_message(raw.as_bytes()).unwrap();
        match msg {
            ClientMessage::CreateRoom { settings, .. } => {
                assert_eq!(settings.max_players, 8);
                assert_eq!(settings.lap_count, 3);
                assert!(settings.allow_mid_race_join);
                assert!(settings.enable_chat);
                assert!(!settings.is_private);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_server_message_tagging() {
        let msg = ServerMessage::Welcome {
            player_id: Uuid::nil(),
            server_time: 100.0,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "welcome");
        assert!(json["playerId"].is_string());
        assert_eq!(json["serverTime"], 100.0);
    }

    #[test]
    fn test_error_code_wire_form() {
        let msg = ServerMessage::Error {
            code: ErrorCode::InvalidNickname,
            message: "bad nickname".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["code"], "INVALID_NICKNAME");
    }

    #[test]
    fn test_oversized_message_rejected() {
        let huge = vec![b' '; MAX_MESSAGE_BYTES + 1];
        assert!(matches!(
            decode_client_message(&huge),
            Err(ProtocolError::TooLarge)
        ));
    }
}
