//! Software raster surface.

use image::{ImageFormat, RgbImage};
use inkcast_core::canvas::{SnapshotData, Surface, SurfaceError};
use inkcast_core::stroke::{Rgb, StrokeOp, Tool};
use kurbo::{Line, ParamCurveNearest, Point, Rect};
use std::io::Cursor;

/// Default canvas width in pixels.
pub const DEFAULT_CANVAS_WIDTH: u32 = 1280;
/// Default canvas height in pixels.
pub const DEFAULT_CANVAS_HEIGHT: u32 = 720;

/// Opaque RGB pixel canvas.
///
/// Every operation overwrites the pixels it covers with a solid color, so
/// drawing the same operation twice leaves the canvas unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSurface {
    image: RgbImage,
    background: Rgb,
}

impl RasterSurface {
    /// Create a blank white canvas.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_background(width, height, Rgb::white())
    }

    /// Create a blank canvas filled with `background`.
    pub fn with_background(width: u32, height: u32, background: Rgb) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, pixel(background)),
            background,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn background(&self) -> Rgb {
        self.background
    }

    /// Color at a pixel, if inside the canvas.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        self.image.get_pixel_checked(x, y).map(|p| Rgb::new(p[0], p[1], p[2]))
    }

    /// The underlying pixel buffer.
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Paint every pixel inside `bounds` whose center satisfies `covered`.
    fn fill_where(&mut self, bounds: Rect, color: Rgb, covered: impl Fn(Point) -> bool) {
        let x0 = bounds.x0.floor().max(0.0) as u32;
        let y0 = bounds.y0.floor().max(0.0) as u32;
        let x1 = bounds.x1.ceil().min(self.image.width() as f64).max(0.0) as u32;
        let y1 = bounds.y1.ceil().min(self.image.height() as f64).max(0.0) as u32;

        let value = pixel(color);
        for y in y0..y1 {
            for x in x0..x1 {
                let center = Point::new(x as f64 + 0.5, y as f64 + 0.5);
                if covered(center) {
                    self.image.put_pixel(x, y, value);
                }
            }
        }
    }

    /// Thick segment with round caps.
    fn segment(&mut self, from: Point, to: Point, width: f64, color: Rgb) {
        let radius = half_width(width);
        let bounds = Rect::from_points(from, to).inflate(radius, radius);
        let line = Line::new(from, to);
        let limit = radius * radius;
        self.fill_where(bounds, color, |p| distance_sq_to_line(line, p) <= limit);
    }

    fn rectangle(&mut self, corner: Point, opposite: Point, width: f64, color: Rgb) {
        let rect = Rect::from_points(corner, opposite);
        let corners = [
            Point::new(rect.x0, rect.y0),
            Point::new(rect.x1, rect.y0),
            Point::new(rect.x1, rect.y1),
            Point::new(rect.x0, rect.y1),
        ];
        for i in 0..corners.len() {
            self.segment(corners[i], corners[(i + 1) % corners.len()], width, color);
        }
    }

    /// Circle outline: `center` plus a point on the circumference.
    fn circle(&mut self, center: Point, rim: Point, width: f64, color: Rgb) {
        let radius = center.distance(rim);
        let half = half_width(width);
        let extent = radius + half;
        let bounds = Rect::from_center_size(center, (extent * 2.0, extent * 2.0));
        self.fill_where(bounds, color, |p| (p.distance(center) - radius).abs() <= half);
    }
}

impl Default for RasterSurface {
    fn default() -> Self {
        Self::new(DEFAULT_CANVAS_WIDTH, DEFAULT_CANVAS_HEIGHT)
    }
}

impl Surface for RasterSurface {
    fn apply(&mut self, op: &StrokeOp) {
        let width = op.effective_width();
        match op.tool() {
            Tool::Pen | Tool::Line => self.segment(op.origin(), op.endpoint(), width, op.color()),
            Tool::Eraser => self.segment(op.origin(), op.endpoint(), width, self.background),
            Tool::Rectangle => self.rectangle(op.origin(), op.endpoint(), width, op.color()),
            Tool::Circle => self.circle(op.origin(), op.endpoint(), width, op.color()),
        }
    }

    fn clear(&mut self) {
        let value = pixel(self.background);
        for p in self.image.pixels_mut() {
            *p = value;
        }
    }

    fn snapshot(&self) -> Result<SnapshotData, SurfaceError> {
        let mut bytes = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|e| SurfaceError::Encode(e.to_string()))?;
        Ok(SnapshotData::new(bytes))
    }

    fn restore(&mut self, data: &SnapshotData) -> Result<(), SurfaceError> {
        if data.is_empty() {
            self.clear();
            return Ok(());
        }
        let decoded = image::load_from_memory_with_format(data.as_bytes(), ImageFormat::Png)
            .map_err(|e| SurfaceError::Decode(e.to_string()))?
            .to_rgb8();
        if decoded.dimensions() != self.image.dimensions() {
            log::debug!(
                "Snapshot is {:?}, canvas was {:?}",
                decoded.dimensions(),
                self.image.dimensions()
            );
        }
        self.image = decoded;
        Ok(())
    }
}

fn pixel(color: Rgb) -> image::Rgb<u8> {
    image::Rgb(color.to_array())
}

/// Thin strokes still cover the pixel they pass through.
fn half_width(width: f64) -> f64 {
    (width / 2.0).max(0.5)
}

fn distance_sq_to_line(line: Line, p: Point) -> f64 {
    if line.p0 == line.p1 {
        return (p - line.p0).hypot2();
    }
    line.nearest(p, 1e-6).distance_sq
}
