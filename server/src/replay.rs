//! Race replay recording.
//!
//! Rooms accumulate the quantized 20 Hz snapshots of a race and hand the
//! finished recording to this task, which persists it under the `replays`
//! collection. Recording costs the room nothing but memory; disk IO
//! happens here.

use crate::storage::JsonStore;
use gridrush_core::protocol::RaceResult;
use gridrush_core::snapshot::GameSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRecording {
    pub id: String,
    pub room_id: String,
    pub track_id: String,
    pub recorded_at: f64,
    pub frames: Vec<GameSnapshot>,
    pub results: Vec<RaceResult>,
}

impl ReplayRecording {
    pub fn new(room_id: String, track_id: String, recorded_at: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id,
            track_id,
            recorded_at,
            frames: Vec::new(),
            results: Vec::new(),
        }
    }
}

pub fn spawn_recorder(store: Arc<JsonStore>) -> mpsc::UnboundedSender<ReplayRecording> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ReplayRecording>();
    tokio::spawn(async move {
        while let Some(recording) = rx.recv().await {
            if recording.frames.is_empty() {
                continue;
            }
            let key = recording.id.clone();
            match store.write("replays", &key, &recording).await {
                Ok(()) => {
                    info!(replay = %key, frames = recording.frames.len(), "replay saved")
                }
                Err(e) => warn!(replay = %key, "replay write failed: {}", e),
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrush_core::protocol::RoomState;

    fn frame(sequence: u64) -> GameSnapshot {
        GameSnapshot {
            sequence,
            timestamp: 0.0,
            game_state: RoomState::Racing,
            race_time_ms: sequence as f64 * 50.0,
            cars: Vec::new(),
            events: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_recorder_persists_finished_races() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::new(dir.path().to_path_buf()));
        let tx = spawn_recorder(Arc::clone(&store));

        let mut recording =
            ReplayRecording::new("room-1".to_string(), "track-1".to_string(), 0.0);
        let id = recording.id.clone();
        recording.frames.push(frame(1));
        recording.frames.push(frame(2));
        tx.send(recording).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let back: ReplayRecording = store
            .read("replays", &id)
            .await
            .unwrap()
            .expect("replay written");
        assert_eq!(back.frames.len(), 2);
        assert_eq!(back.track_id, "track-1");
    }

    #[tokio::test]
    async fn test_empty_recordings_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::new(dir.path().to_path_buf()));
        let tx = spawn_recorder(Arc::clone(&store));

        let recording = ReplayRecording::new("room-1".to_string(), "track-1".to_string(), 0.0);
        let id = recording.id.clone();
        tx.send(recording).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let back: Option<ReplayRecording> = store.read("replays", &id).await.unwrap();
        assert!(back.is_none());
    }
}
