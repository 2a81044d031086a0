//! Per-track lap-time leaderboards.
//!
//! A leaderboard keeps the 100 fastest laps for a track, at most one entry
//! per nickname (case-insensitive, best time wins), sorted ascending.
//! Rooms report laps through the recorder task so the room tick never
//! touches disk.

use crate::storage::JsonStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

pub const LEADERBOARD_CAP: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub nickname: String,
    pub time_ms: f64,
    pub recorded_at: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboard {
    pub entries: Vec<LeaderboardEntry>,
}

/// A best-lap report from a finished race.
#[derive(Debug, Clone)]
pub struct LapReport {
    pub track_id: String,
    pub nickname: String,
    pub time_ms: f64,
    pub recorded_at: f64,
}

/// Insert an entry, enforcing one-per-nickname, ascending order and the
/// cap. Returns true when the board changed.
pub fn insert_entry(board: &mut Leaderboard, entry: LeaderboardEntry) -> bool {
    if !entry.time_ms.is_finite() || entry.time_ms <= 0.0 {
        return false;
    }

    let key = entry.nickname.to_lowercase();
    if let Some(existing) = board
        .entries
        .iter_mut()
        .find(|e| e.nickname.to_lowercase() == key)
    {
        if entry.time_ms >= existing.time_ms {
            return false;
        }
        *existing = entry;
    } else {
        board.entries.push(entry);
    }

    board
        .entries
        .sort_by(|a, b| a.time_ms.total_cmp(&b.time_ms));
    if board.entries.len() > LEADERBOARD_CAP {
        board.entries.truncate(LEADERBOARD_CAP);
    }
    true
}

/// Spawn the recorder task. Rooms hold the returned sender and fire one
/// report per player at race end.
pub fn spawn_recorder(store: Arc<JsonStore>) -> mpsc::UnboundedSender<LapReport> {
    let (tx, mut rx) = mpsc::unbounded_channel::<LapReport>();
    tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            let mut board: Leaderboard = match store
                .read("leaderboards", &report.track_id)
                .await
            {
                Ok(board) => board.unwrap_or_default(),
                Err(e) => {
                    warn!(track = %report.track_id, "leaderboard read failed: {}", e);
                    continue;
                }
            };

            let changed = insert_entry(
                &mut board,
                LeaderboardEntry {
                    nickname: report.nickname,
                    time_ms: report.time_ms,
                    recorded_at: report.recorded_at,
                },
            );
            if changed {
                if let Err(e) = store.write("leaderboards", &report.track_id, &board).await {
                    warn!(track = %report.track_id, "leaderboard write failed: {}", e);
                }
            }
        }
    });
    tx
}
