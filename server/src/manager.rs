//! Room lifecycle: creation, lookup by id or short code, the session to
//! room index and idle garbage collection.
//!
//! The manager owns the only maps shared across tasks. Rooms themselves
//! are actors reached through their handles; the manager never touches
//! room state.

use crate::config::GameSettings;
use crate::leaderboard::LapReport;
use crate::replay::ReplayRecording;
use crate::room::{Room, RoomCommand, RoomHandle};
use crate::storage::TrackStore;
use gridrush_core::car::PlayerId;
use gridrush_core::protocol::{ErrorCode, RoomSummary};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Room codes avoid characters players misread over voice chat (0/O, 1/I).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LEN: usize = 6;
/// How often the garbage collector sweeps dead rooms and stale mappings.
const GC_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct RoomManager {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    codes: RwLock<HashMap<String, String>>,
    sessions: RwLock<HashMap<PlayerId, String>>,
    tracks: Arc<TrackStore>,
    game_settings: GameSettings,
    closed_tx: mpsc::UnboundedSender<String>,
    lap_reports: mpsc::UnboundedSender<LapReport>,
    replays: mpsc::UnboundedSender<ReplayRecording>,
}

impl RoomManager {
    pub fn new(
        tracks: Arc<TrackStore>,
        game_settings: GameSettings,
        lap_reports: mpsc::UnboundedSender<LapReport>,
        replays: mpsc::UnboundedSender<ReplayRecording>,
    ) -> Arc<Self> {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            codes: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            tracks,
            game_settings,
            closed_tx,
            lap_reports,
            replays,
        });

        tokio::spawn(Self::reap_closed(Arc::clone(&manager), closed_rx));
        tokio::spawn(Self::sweep(Arc::clone(&manager)));
        manager
    }

    pub async fn create_room(
        &self,
        host: PlayerId,
        settings: gridrush_core::protocol::RoomSettings,
    ) -> Result<RoomHandle, (ErrorCode, String)> {
        let track = match &settings.track_id {
            Some(id) => match self.tracks.get(id).await {
                Some(track) => track,
                None => {
                    debug!(track = %id, "requested track missing, using default");
                    self.tracks.default_track().await
                }
            },
            None => self.tracks.default_track().await,
        };

        let id = Uuid::new_v4().to_string();
        let code = self.generate_code().await;

        let handle = Room::spawn(
            id.clone(),
            code.clone(),
            host,
            settings,
            self.game_settings.clone(),
            track,
            self.closed_tx.clone(),
            self.lap_reports.clone(),
            self.replays.clone(),
        );

        self.rooms.write().await.insert(id.clone(), handle.clone());
        self.codes.write().await.insert(code.clone(), id.clone());
        info!(room = %id, code = %code, "room created");
        Ok(handle)
    }

    async fn generate_code(&self) -> String {
        let codes = self.codes.read().await;
        let mut rng = rand::rng();
        loop {
            let code: String = (0..ROOM_CODE_LEN)
                .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
                .collect();
            if !codes.contains_key(&code) {
                return code;
            }
        }
    }

    /// Resolve a room reference: a UUID-style id, or a 6-char code. The
    /// second element says whether the lookup went through the code,
    /// which is what unlocks private rooms.
    pub async fn find_room(&self, reference: &str) -> Option<(RoomHandle, bool)> {
        if let Some(handle) = self.rooms.read().await.get(reference) {
            return Some((handle.clone(), false));
        }
        let code = reference.to_uppercase();
        let room_id = self.codes.read().await.get(&code).cloned()?;
        self.rooms
            .read()
            .await
            .get(&room_id)
            .map(|h| (h.clone(), true))
    }

    pub async fn room_for_session(&self, session_id: PlayerId) -> Option<RoomHandle> {
        let room_id = self.sessions.read().await.get(&session_id).cloned()?;
        self.rooms.read().await.get(&room_id).cloned()
    }

    /// Record a successful join, detaching the session from any previous
    /// room first.
    pub async fn set_session_room(&self, session_id: PlayerId, room_id: String) {
        if let Some(old_id) = self.sessions.read().await.get(&session_id).cloned() {
            if old_id != room_id {
                if let Some(handle) = self.rooms.read().await.get(&old_id) {
                    let _ = handle.send(RoomCommand::Leave { session_id });
                }
            }
        }
        self.sessions.write().await.insert(session_id, room_id);
    }

    pub async fn clear_session(&self, session_id: PlayerId) {
        self.sessions.write().await.remove(&session_id);
    }

    pub async fn room_summaries(&self) -> Vec<RoomSummary> {
        let handles: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            if handle.is_private {
                continue;
            }
            if let Some(summary) = handle.summary().await {
                summaries.push(summary);
            }
        }
        summaries
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn remove_room(&self, room_id: &str) {
        if self.rooms.write().await.remove(room_id).is_some() {
            self.codes.write().await.retain(|_, id| id != room_id);
            self.sessions.write().await.retain(|_, id| id != room_id);
            info!(room = %room_id, "room removed");
        }
    }

    /// Rooms report their own shutdown; drop them from the indexes as the
    /// reports come in.
    async fn reap_closed(manager: Arc<Self>, mut closed_rx: mpsc::UnboundedReceiver<String>) {
        while let Some(room_id) = closed_rx.recv().await {
            manager.remove_room(&room_id).await;
        }
    }

    /// Periodic sweep for rooms that died without reporting (e.g. a
    /// panicked room task) and for stale session mappings.
    async fn sweep(manager: Arc<Self>) {
        let mut ticker = tokio::time::interval(GC_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let dead: Vec<String> = manager
                .rooms
                .read()
                .await
                .iter()
                .filter(|(_, handle)| handle.is_closed())
                .map(|(id, _)| id.clone())
                .collect();
            for room_id in dead {
                warn!(room = %room_id, "sweeping dead room");
                manager.remove_room(&room_id).await;
            }
        }
    }
}
