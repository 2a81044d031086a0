//! Static track model and the JSON track file format.
//!
//! A track is immutable for the duration of a race. Elements carry an
//! axis-aligned rectangle (centered on `x, y`), a rotation and a small set
//! of type-specific fields. Editor-only element kinds (`select`, `car`)
//! are accepted on input for compatibility with older editor exports and
//! stripped before persistence.

use crate::math::{wrap_delta, Vec2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Minimum distance between any two spawn points.
pub const MIN_SPAWN_SPACING: f32 = 20.0;

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("invalid track: {0}")]
    Invalid(String),
    #[error("track parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Extreme,
}

impl Default for Difficulty {
    fn default() -> Self {
        Difficulty::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Road,
    RoadCurve,
    Wall,
    Checkpoint,
    Finish,
    #[serde(alias = "boost_pad")]
    Boost,
    #[serde(alias = "oil_slick")]
    Oil,
    Spawn,
    Ramp,
    RampUp,
    RampDown,
    Bridge,
    Barrier,
    TireStack,
    PitStop,
    // Editor-only kinds, stripped before persistence.
    Select,
    Car,
}

impl ElementKind {
    /// Kinds that only exist inside the visual editor.
    pub fn is_editor_only(self) -> bool {
        matches!(self, ElementKind::Select | ElementKind::Car)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackElement {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    /// Center of the element's bounding rectangle.
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub rotation: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<i8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, serde_json::Value>>,
}

impl TrackElement {
    pub fn center(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }

    /// Radius of the circumscribed circle used for proximity checks.
    pub fn radius(&self) -> f32 {
        self.width.max(self.height) / 2.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub created_at: Option<u64>,
    #[serde(default)]
    pub updated_at: Option<u64>,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default = "default_lap_count")]
    pub default_lap_count: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub wrap_around: bool,
    pub elements: Vec<TrackElement>,
    #[serde(default)]
    pub scenery: Vec<TrackElement>,
}

fn default_lap_count() -> u32 {
    3
}

impl Track {
    pub fn from_json(content: &str) -> Result<Track, TrackError> {
        let track: Track = serde_json::from_str(content)?;
        track.validate()?;
        Ok(track)
    }

    /// Remove editor-only elements; called before a track is persisted.
    pub fn strip_editor_elements(&mut self) {
        self.elements.retain(|e| !e.kind.is_editor_only());
        self.scenery.retain(|e| !e.kind.is_editor_only());
    }

    pub fn validate(&self) -> Result<(), TrackError> {
        if self.version < 1 {
            return Err(TrackError::Invalid("version must be >= 1".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(TrackError::Invalid(
                "width and height must be positive".into(),
            ));
        }

        let finish_count = self
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::Finish)
            .count();
        if finish_count != 1 {
            return Err(TrackError::Invalid(format!(
                "expected exactly one finish element, found {}",
                finish_count
            )));
        }

        let spawns = self.spawns();
        if spawns.is_empty() {
            return Err(TrackError::Invalid(
                "track needs at least one spawn point".into(),
            ));
        }
        for (i, a) in spawns.iter().enumerate() {
            for b in spawns.iter().skip(i + 1) {
                if a.center().distance(b.center()) < MIN_SPAWN_SPACING {
                    return Err(TrackError::Invalid(format!(
                        "spawns {} and {} are closer than {}",
                        a.id, b.id, MIN_SPAWN_SPACING
                    )));
                }
            }
        }

        let mut indices: Vec<u32> = self
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::Checkpoint)
            .filter_map(|e| e.checkpoint_index)
            .collect();
        indices.sort_unstable();
        for (expected, actual) in indices.iter().enumerate() {
            if *actual != expected as u32 {
                return Err(TrackError::Invalid(format!(
                    "checkpoint indices must form 0..{} without gaps",
                    indices.len()
                )));
            }
        }
        let checkpoint_count = self
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::Checkpoint)
            .count();
        if checkpoint_count != indices.len() {
            return Err(TrackError::Invalid(
                "every checkpoint needs a checkpointIndex".into(),
            ));
        }

        Ok(())
    }

    pub fn finish(&self) -> &TrackElement {
        // validate() guarantees exactly one finish element
        self.elements
            .iter()
            .find(|e| e.kind == ElementKind::Finish)
            .expect("validated track has a finish element")
    }

    pub fn spawns(&self) -> Vec<&TrackElement> {
        self.elements
            .iter()
            .filter(|e| e.kind == ElementKind::Spawn)
            .collect()
    }

    /// Checkpoints sorted by their index.
    pub fn checkpoints(&self) -> Vec<&TrackElement> {
        let mut cps: Vec<&TrackElement> = self
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::Checkpoint)
            .collect();
        cps.sort_by_key(|e| e.checkpoint_index.unwrap_or(u32::MAX));
        cps
    }

    pub fn checkpoint_count(&self) -> usize {
        self.elements
            .iter()
            .filter(|e| e.kind == ElementKind::Checkpoint)
            .count()
    }

    /// Distance between two points, toroidal on wrap-around tracks.
    pub fn distance(&self, a: Vec2, b: Vec2) -> f32 {
        if self.wrap_around {
            let dx = wrap_delta(a.x, b.x, self.width as f32);
            let dy = wrap_delta(a.y, b.y, self.height as f32);
            (dx * dx + dy * dy).sqrt()
        } else {
            a.distance(b)
        }
    }

    /// Is `pos` within the circumscribed circle of `element`?
    pub fn within_element(&self, pos: Vec2, element: &TrackElement) -> bool {
        self.distance(pos, element.center()) <= element.radius()
    }

    /// The built-in speedway used when a requested track is missing and as
    /// the seed for the track store.
    pub fn default_speedway() -> Track {
        let mut elements = Vec::new();

        let road = |id: &str, x: f32, y: f32, w: f32, h: f32, rot: f32| TrackElement {
            id: id.to_string(),
            kind: ElementKind::Road,
            x,
            y,
            width: w,
            height: h,
            rotation: rot,
            layer: None,
            checkpoint_index: None,
            properties: None,
        };
        // A simple rectangular circuit: two straights, two connecting legs.
        elements.push(road("road-left", 180.0, 300.0, 120.0, 480.0, 0.0));
        elements.push(road("road-right", 620.0, 300.0, 120.0, 480.0, 0.0));
        elements.push(road("road-top", 400.0, 90.0, 560.0, 120.0, 0.0));
        elements.push(road("road-bottom", 400.0, 510.0, 560.0, 120.0, 0.0));

        elements.push(TrackElement {
            id: "finish".to_string(),
            kind: ElementKind::Finish,
            x: 180.0,
            y: 420.0,
            width: 120.0,
            height: 20.0,
            rotation: 0.0,
            layer: None,
            checkpoint_index: None,
            properties: None,
        });

        let checkpoint = |id: &str, index: u32, x: f32, y: f32, rot: f32| TrackElement {
            id: id.to_string(),
            kind: ElementKind::Checkpoint,
            x,
            y,
            width: 120.0,
            height: 20.0,
            rotation: rot,
            layer: None,
            checkpoint_index: Some(index),
            properties: None,
        };
        elements.push(checkpoint("cp-0", 0, 180.0, 120.0, 0.0));
        elements.push(checkpoint("cp-1", 1, 620.0, 120.0, 0.0));
        elements.push(checkpoint("cp-2", 2, 620.0, 480.0, 0.0));

        for (i, y) in [470.0_f32, 500.0, 530.0, 560.0].iter().enumerate() {
            elements.push(TrackElement {
                id: format!("spawn-{}", i),
                kind: ElementKind::Spawn,
                x: 180.0,
                y: *y,
                width: 30.0,
                height: 20.0,
                rotation: 0.0,
                layer: None,
                checkpoint_index: None,
                properties: None,
            });
        }

        elements.push(TrackElement {
            id: "boost-0".to_string(),
            kind: ElementKind::Boost,
            x: 400.0,
            y: 90.0,
            width: 60.0,
            height: 40.0,
            rotation: 0.0,
            layer: None,
            checkpoint_index: None,
            properties: None,
        });

        Track {
            id: "default-speedway".to_string(),
            version: 1,
            name: "Speedway".to_string(),
            author: "GridRush".to_string(),
            created_at: None,
            updated_at: None,
            difficulty: Difficulty::Easy,
            default_lap_count: 3,
            width: 800,
            height: 600,
            wrap_around: false,
            elements,
            scenery: Vec::new(),
        }
    }
}
