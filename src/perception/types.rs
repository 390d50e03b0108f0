use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::perception::stability::FrameSignature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Left => "left",
            Side::Right => "right",
        })
    }
}

/// Normalized bounding box `[xmin, ymin, xmax, ymax]` in range 0.0–1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub const FULL: BBox = BBox { x0: 0.0, y0: 0.0, x1: 1.0, y1: 1.0 };

    pub const fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn is_valid(&self) -> bool {
        let unit = 0.0..=1.0;
        unit.contains(&self.x0)
            && unit.contains(&self.y0)
            && unit.contains(&self.x1)
            && unit.contains(&self.y1)
            && self.x0 < self.x1
            && self.y0 < self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }

    /// Pixel rectangle `(x, y, w, h)` of this box inside a `width`×`height`
    /// image, clamped to the image bounds.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let px = |v: f32, max: u32| ((v.clamp(0.0, 1.0) * max as f32).round() as u32).min(max);
        let (x0, y0) = (px(self.x0, width), px(self.y0, height));
        let (x1, y1) = (px(self.x1, width), px(self.y1, height));
        (x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }

    /// Inverse of [`BBox::to_pixels`].
    pub fn from_pixels(x: u32, y: u32, w: u32, h: u32, width: u32, height: u32) -> Self {
        let (fw, fh) = (width.max(1) as f32, height.max(1) as f32);
        Self {
            x0: (x as f32 / fw).clamp(0.0, 1.0),
            y0: (y as f32 / fh).clamp(0.0, 1.0),
            x1: ((x + w) as f32 / fw).clamp(0.0, 1.0),
            y1: ((y + h) as f32 / fh).clamp(0.0, 1.0),
        }
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        BBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x0, b.y0, b.x1, b.y1]
    }
}

/// Screen position and size of the captured client area, in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl WindowGeometry {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn center(&self) -> (i32, i32) {
        (self.x + (self.width / 2) as i32, self.y + (self.height / 2) as i32)
    }
}

/// One captured image of the target window. Immutable once created.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<RgbaImage>,
    /// Monotonic capture time; the staleness guard measures against this.
    pub captured_at: Instant,
    pub captured_wall: chrono::DateTime<chrono::Utc>,
    pub geometry: WindowGeometry,
}

impl Frame {
    pub fn new(image: RgbaImage, geometry: WindowGeometry) -> Self {
        Self {
            image: Arc::new(image),
            captured_at: Instant::now(),
            captured_wall: chrono::Utc::now(),
            geometry,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }
}

/// A recognised OCR word. Low-confidence tokens are kept and flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextToken {
    pub text: String,
    /// Position in normalized frame coordinates.
    pub bbox: BBox,
    pub confidence: f32,
    pub low_confidence: bool,
    /// Name of the OCR region the token was read from.
    pub region: String,
    /// Line index within its region, top to bottom.
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CueKind {
    /// Open floor continuing straight ahead between walls.
    CorridorAhead,
    WallEdge(Side),
    /// A side opening or a turn-arrow indicator.
    TurnMarker(Side),
    /// A closed door (frame silhouette or jambs) ahead.
    DoorFrame,
    DoorOpen,
    /// A surface facing the avatar that blocks forward movement.
    Obstacle,
}

impl CueKind {
    pub const ALL: [CueKind; 8] = [
        CueKind::CorridorAhead,
        CueKind::WallEdge(Side::Left),
        CueKind::WallEdge(Side::Right),
        CueKind::TurnMarker(Side::Left),
        CueKind::TurnMarker(Side::Right),
        CueKind::DoorFrame,
        CueKind::DoorOpen,
        CueKind::Obstacle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CueKind::CorridorAhead => "corridor_ahead",
            CueKind::WallEdge(Side::Left) => "wall_left",
            CueKind::WallEdge(Side::Right) => "wall_right",
            CueKind::TurnMarker(Side::Left) => "turn_left",
            CueKind::TurnMarker(Side::Right) => "turn_right",
            CueKind::DoorFrame => "door_frame",
            CueKind::DoorOpen => "door_open",
            CueKind::Obstacle => "obstacle",
        }
    }
}

impl fmt::Display for CueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        CueKind::ALL
            .into_iter()
            .find(|k| k.as_str() == needle)
            .ok_or_else(|| format!("unknown cue kind: {s}"))
    }
}

impl Serialize for CueKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CueKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum CueSource {
    Heuristic,
    Template(String),
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CueMatch {
    pub kind: CueKind,
    pub bbox: BBox,
    pub confidence: f32,
    pub source: CueSource,
}

impl CueMatch {
    pub fn is_geometric(&self) -> bool {
        self.source != CueSource::Text
    }
}

/// Everything perception extracted from exactly one [`Frame`].
#[derive(Debug, Clone)]
pub struct SceneObservation {
    pub captured_at: Instant,
    pub geometry: WindowGeometry,
    pub tokens: Vec<TextToken>,
    pub cues: Vec<CueMatch>,
    /// False when OCR was skipped for this tick (cadence or disabled).
    pub ocr_ran: bool,
    /// Two or more short text lines in one region, i.e. a choice list.
    pub menu_detected: bool,
    pub signature: FrameSignature,
    /// Working-resolution grayscale image, kept for observers.
    pub preview: Arc<GrayImage>,
}

impl SceneObservation {
    /// Strongest match of `kind` from any source.
    pub fn best_cue(&self, kind: CueKind) -> Option<&CueMatch> {
        self.cues
            .iter()
            .filter(|c| c.kind == kind)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    pub fn cue_confidence(&self, kind: CueKind) -> f32 {
        self.best_cue(kind).map_or(0.0, |c| c.confidence)
    }

    pub fn has_geometric_cue(&self, threshold: f32) -> bool {
        self.cues.iter().any(|c| c.is_geometric() && c.confidence >= threshold)
    }

    pub fn confident_tokens(&self) -> impl Iterator<Item = &TextToken> {
        self.tokens.iter().filter(|t| !t.low_confidence)
    }

    pub fn has_confident_text(&self) -> bool {
        self.confident_tokens().next().is_some()
    }
}
