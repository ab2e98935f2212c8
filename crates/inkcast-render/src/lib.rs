//! Inkcast Render Library
//!
//! Materializes stroke operations into pixels. [`RasterSurface`] is the
//! canvas both the session store and native clients draw onto; its
//! snapshots are lossless PNG images.

mod raster;

pub use raster::{DEFAULT_CANVAS_HEIGHT, DEFAULT_CANVAS_WIDTH, RasterSurface};
