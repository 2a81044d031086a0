//! GridRush server internals.
//!
//! The server multiplexes many independent rooms. Each room is a single
//! logical actor (one tokio task owning all of its state) driving a 60 Hz
//! physics loop and a 20 Hz snapshot broadcast; the gateway runs one task
//! per client session and never touches room state directly, it only sends
//! messages into room inboxes.

pub mod arbiter;
pub mod config;
pub mod gateway;
pub mod http;
pub mod leaderboard;
pub mod manager;
pub mod replay;
pub mod room;
pub mod storage;
