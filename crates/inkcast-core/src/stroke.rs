//! Stroke operations, the atomic unit of drawing.
//!
//! Free-hand tools (pen, eraser) produce one short segment operation per
//! input sample. Shape tools (line, rectangle, circle) produce a single
//! operation holding only the two defining points; the rendering side expands
//! them into the full shape.

use kurbo::Point;
use peniko::Color;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Eraser strokes cover this multiple of the nominal stroke width.
pub const ERASER_WIDTH_FACTOR: f64 = 4.0;

/// Validation errors for stroke operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid color: {0}")]
    InvalidColor(String),
    #[error("Stroke width must be positive and finite, got {0}")]
    InvalidWidth(f64),
    #[error("Coordinates must be finite")]
    NonFiniteCoordinate,
}

/// Drawing tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Pen,
    Eraser,
    Line,
    Rectangle,
    Circle,
}

impl Tool {
    /// Shape tools are a single acknowledged operation.
    pub fn is_shape(self) -> bool {
        matches!(self, Tool::Line | Tool::Rectangle | Tool::Circle)
    }

    /// Free-hand tools stream one segment per input sample.
    pub fn is_freehand(self) -> bool {
        !self.is_shape()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tool::Pen => "pen",
            Tool::Eraser => "eraser",
            Tool::Line => "line",
            Tool::Rectangle => "rectangle",
            Tool::Circle => "circle",
        }
    }
}

impl FromStr for Tool {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pen" => Ok(Tool::Pen),
            "eraser" => Ok(Tool::Eraser),
            "line" => Ok(Tool::Line),
            "rectangle" => Ok(Tool::Rectangle),
            "circle" => Ok(Tool::Circle),
            other => Err(ValidationError::UnknownTool(other.to_string())),
        }
    }
}

/// 8-bit RGB color, carried on the wire as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub const fn black() -> Self {
        Self::new(0, 0, 0)
    }

    pub const fn white() -> Self {
        Self::new(255, 255, 255)
    }

    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl FromStr for Rgb {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidColor(s.to_string());
        let hex = s.strip_prefix('#').ok_or_else(invalid)?;
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
        Ok(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl TryFrom<String> for Rgb {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rgb> for String {
    fn from(color: Rgb) -> Self {
        color.to_string()
    }
}

impl From<Color> for Rgb {
    fn from(color: Color) -> Self {
        let rgba = color.to_rgba8();
        Self::new(rgba.r, rgba.g, rgba.b)
    }
}

impl From<Rgb> for Color {
    fn from(color: Rgb) -> Self {
        Color::from_rgba8(color.r, color.g, color.b, 255)
    }
}

/// Loose wire form of a stroke operation.
///
/// Deserializes anything structurally plausible so that a bad tool name or
/// color can be rejected for a specific `client_op_id` rather than failing
/// the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokeDraft {
    pub tool: String,
    pub color: String,
    pub stroke_width: f64,
    pub origin: Point,
    pub endpoint: Point,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub clear_epoch: u64,
    #[serde(default)]
    pub client_op_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

/// An immutable drawing operation.
///
/// Freshly built operations carry no sequence number; the session store
/// assigns one on acceptance via [`StrokeOp::stamped`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StrokeDraft", into = "StrokeDraft")]
pub struct StrokeOp {
    tool: Tool,
    color: Rgb,
    stroke_width: f64,
    origin: Point,
    endpoint: Point,
    session_id: String,
    author_id: String,
    clear_epoch: u64,
    client_op_id: u64,
    sequence_number: Option<u64>,
}

impl StrokeOp {
    /// Build an unaddressed, unstamped operation.
    pub fn new(
        tool: Tool,
        color: Rgb,
        stroke_width: f64,
        origin: Point,
        endpoint: Point,
    ) -> Result<Self, ValidationError> {
        if !stroke_width.is_finite() || stroke_width <= 0.0 {
            return Err(ValidationError::InvalidWidth(stroke_width));
        }
        if !is_finite(origin) || !is_finite(endpoint) {
            return Err(ValidationError::NonFiniteCoordinate);
        }
        Ok(Self {
            tool,
            color,
            stroke_width,
            origin,
            endpoint,
            session_id: String::new(),
            author_id: String::new(),
            clear_epoch: 0,
            client_op_id: 0,
            sequence_number: None,
        })
    }

    /// Attach the session, author and epoch the operation is published under.
    pub fn addressed(
        self,
        session_id: impl Into<String>,
        author_id: impl Into<String>,
        clear_epoch: u64,
        client_op_id: u64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            author_id: author_id.into(),
            clear_epoch,
            client_op_id,
            ..self
        }
    }

    /// Assign the store's sequence number.
    pub fn stamped(self, sequence_number: u64) -> Self {
        debug_assert!(self.sequence_number.is_none(), "operation stamped twice");
        Self {
            sequence_number: Some(sequence_number),
            ..self
        }
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn color(&self) -> Rgb {
        self.color
    }

    pub fn stroke_width(&self) -> f64 {
        self.stroke_width
    }

    /// Width actually covered on the canvas.
    pub fn effective_width(&self) -> f64 {
        match self.tool {
            Tool::Eraser => self.stroke_width * ERASER_WIDTH_FACTOR,
            _ => self.stroke_width,
        }
    }

    pub fn origin(&self) -> Point {
        self.origin
    }

    pub fn endpoint(&self) -> Point {
        self.endpoint
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    pub fn clear_epoch(&self) -> u64 {
        self.clear_epoch
    }

    pub fn client_op_id(&self) -> u64 {
        self.client_op_id
    }

    pub fn sequence_number(&self) -> Option<u64> {
        self.sequence_number
    }

    /// Whether this operation was authored by `participant` as `client_op_id`.
    pub fn is_own(&self, participant: &str, client_op_id: u64) -> bool {
        self.author_id == participant && self.client_op_id == client_op_id
    }
}

fn is_finite(p: Point) -> bool {
    p.x.is_finite() && p.y.is_finite()
}

impl TryFrom<StrokeDraft> for StrokeOp {
    type Error = ValidationError;

    fn try_from(draft: StrokeDraft) -> Result<Self, Self::Error> {
        let tool = draft.tool.parse()?;
        let color = draft.color.parse()?;
        let op = StrokeOp::new(tool, color, draft.stroke_width, draft.origin, draft.endpoint)?
            .addressed(draft.session_id, draft.author_id, draft.clear_epoch, draft.client_op_id);
        Ok(Self {
            sequence_number: draft.sequence_number,
            ..op
        })
    }
}

impl From<StrokeOp> for StrokeDraft {
    fn from(op: StrokeOp) -> Self {
        Self {
            tool: op.tool.as_str().to_string(),
            color: op.color.to_string(),
            stroke_width: op.stroke_width,
            origin: op.origin,
            endpoint: op.endpoint,
            session_id: op.session_id,
            author_id: op.author_id,
            clear_epoch: op.clear_epoch,
            client_op_id: op.client_op_id,
            sequence_number: op.sequence_number,
        }
    }
}
