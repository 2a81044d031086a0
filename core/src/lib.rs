//! Shared simulation core for GridRush.
//!
//! Everything the server and the client must agree on byte-for-byte lives
//! here: the 2D math primitives, the track model, the car state, the
//! fixed-tick physics integrator, the wire protocol and the quantized
//! snapshot records. The server adds arbitration and room plumbing on top;
//! the client adds prediction and interpolation. Neither reimplements the
//! integrator.

pub mod car;
pub mod math;
pub mod physics;
pub mod protocol;
pub mod snapshot;
pub mod track;

pub use car::{CarState, InputState};
pub use math::Vec2;
pub use snapshot::{CarSnapshot, GameSnapshot, RaceEvent};
pub use track::{ElementKind, Track, TrackElement};
