//! # Stroke Model
//!
//! A [`Stroke`] is one continuous brush action: the pointer went down, moved
//! through `points`, and came back up. Strokes are the only drawing state a
//! session carries. Erasing is a stroke with the `erase` flag set, and
//! deleting a stroke only flips its `deleted` tombstone, so the session log
//! is a pure append-only sequence that replays identically everywhere.
//!
//! Clients never pick stroke ids. They submit a [`NewStroke`] and the server
//! hands back the stored [`Stroke`] once it has been accepted. On the wire a
//! submission travels as a [`StrokeDraft`], whose numbers are wide enough to
//! hold out-of-range values so they can be refused as invalid strokes.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Server-assigned stroke identifier; defines the canonical event order.
pub type StrokeId = u64;

/// Widest brush the session accepts, in canvas units.
pub const MAX_WIDTH: u32 = 512;

/// A position on the shared canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// RGBA brush color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    #[serde(default = "opaque")]
    pub a: u8,
}

fn opaque() -> u8 {
    u8::MAX
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const RED: Color = Color::rgb(255, 0, 0);
    pub const GREEN: Color = Color::rgb(0, 255, 0);
    pub const BLUE: Color = Color::rgb(0, 0, 255);
    pub const WHITE: Color = Color::rgb(255, 255, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: u8::MAX }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

/// Why a stroke was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrokeError {
    #[error("stroke has no points")]
    NoPoints,
    #[error("brush width {0} is outside 1..={max}", max = MAX_WIDTH)]
    Width(i64),
    #[error("color channel {channel} is {value}, expected 0..=255")]
    ColorChannel { channel: char, value: i64 },
    #[error("point {index} is not a finite coordinate")]
    NonFinitePoint { index: usize },
    #[error("color alpha must be non-zero for a paint stroke")]
    Transparent,
    #[error("stroke ids must be assigned by the server")]
    Unassigned,
}

/// A stroke as submitted by a client, before the server has accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStroke {
    pub points: Vec<Point>,
    pub color: Color,
    pub width: u32,
    #[serde(default)]
    pub erase: bool,
}

impl NewStroke {
    pub fn new(points: Vec<Point>, color: Color, width: u32) -> Self {
        Self {
            points,
            color,
            width,
            erase: false,
        }
    }

    /// An eraser pass. It replays exactly like paint; renderers draw it in
    /// the canvas background.
    pub fn eraser(points: Vec<Point>, width: u32) -> Self {
        Self {
            points,
            color: Color::WHITE,
            width,
            erase: true,
        }
    }

    pub fn validate(&self) -> Result<(), StrokeError> {
        validate_shape(&self.points, self.color, self.width, self.erase)
    }
}

/// A submitted stroke as decoded from the wire, not yet range checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeDraft {
    pub points: Vec<Point>,
    pub color: DraftColor,
    pub width: i64,
    #[serde(default)]
    pub erase: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftColor {
    pub r: i64,
    pub g: i64,
    pub b: i64,
    #[serde(default = "opaque_wide")]
    pub a: i64,
}

fn opaque_wide() -> i64 {
    i64::from(u8::MAX)
}

impl DraftColor {
    fn narrow(self) -> Result<Color, StrokeError> {
        let channel = |channel: char, value: i64| {
            u8::try_from(value).map_err(|_| StrokeError::ColorChannel { channel, value })
        };
        Ok(Color {
            r: channel('r', self.r)?,
            g: channel('g', self.g)?,
            b: channel('b', self.b)?,
            a: channel('a', self.a)?,
        })
    }
}

impl From<Color> for DraftColor {
    fn from(color: Color) -> Self {
        Self {
            r: color.r.into(),
            g: color.g.into(),
            b: color.b.into(),
            a: color.a.into(),
        }
    }
}

impl From<NewStroke> for StrokeDraft {
    fn from(stroke: NewStroke) -> Self {
        Self {
            points: stroke.points,
            color: stroke.color.into(),
            width: stroke.width.into(),
            erase: stroke.erase,
        }
    }
}

/// Range checks every field, then runs the usual [`NewStroke::validate`].
impl TryFrom<StrokeDraft> for NewStroke {
    type Error = StrokeError;

    fn try_from(draft: StrokeDraft) -> Result<Self, StrokeError> {
        let width = u32::try_from(draft.width).map_err(|_| StrokeError::Width(draft.width))?;
        let stroke = NewStroke {
            points: draft.points,
            color: draft.color.narrow()?,
            width,
            erase: draft.erase,
        };
        stroke.validate()?;
        Ok(stroke)
    }
}

/// A stroke accepted into a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub id: StrokeId,
    pub points: Vec<Point>,
    pub color: Color,
    pub width: u32,
    #[serde(default)]
    pub erase: bool,
    #[serde(default)]
    pub deleted: bool,
    pub author: Uuid,
}

impl Stroke {
    pub(crate) fn accept(id: StrokeId, stroke: NewStroke, author: Uuid) -> Self {
        Self {
            id,
            points: stroke.points,
            color: stroke.color,
            width: stroke.width,
            erase: stroke.erase,
            deleted: false,
            author,
        }
    }

    /// Checks a stored stroke, e.g. one read back from an export file.
    pub fn validate(&self) -> Result<(), StrokeError> {
        if self.id == 0 {
            return Err(StrokeError::Unassigned);
        }
        validate_shape(&self.points, self.color, self.width, self.erase)
    }
}

fn validate_shape(points: &[Point], color: Color, width: u32, erase: bool) -> Result<(), StrokeError> {
    if points.is_empty() {
        return Err(StrokeError::NoPoints);
    }
    if width == 0 || width > MAX_WIDTH {
        return Err(StrokeError::Width(width.into()));
    }
    if let Some(index) = points.iter().position(|p| !p.is_finite()) {
        return Err(StrokeError::NonFinitePoint { index });
    }
    // The eraser ignores color entirely.
    if !erase && color.a == 0 {
        return Err(StrokeError::Transparent);
    }
    Ok(())
}
