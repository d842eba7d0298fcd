//! Captured frames.
//!
//! - `Frame`: RGB raster plus the Unix timestamp of the sampling instant.
//! - `DecodedImage`: what a video backend hands back before the capture engine
//!   stamps it.
//!
//! Frames are transient. The capture engine owns them until they are handed to
//! the detector; nothing in the pipeline keeps a frame past one tick.

use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};

/// Raw RGB8 pixels straight from a video backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl DecodedImage {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "decoded image has {} bytes, expected {} for {}x{} RGB",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }
}

/// A sampled frame.
///
/// Pixel bytes are private; consumers read them through `pixels()` or
/// encode them with `to_png()`.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Seconds since the Unix epoch at the sampling instant.
    pub timestamp: f64,
}

impl Frame {
    pub(crate) fn from_decoded(image: DecodedImage, timestamp: f64) -> Self {
        Self {
            data: image.pixels,
            width: image.width,
            height: image.height,
            timestamp,
        }
    }

    /// Build a frame from caller-owned RGB8 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, timestamp: f64) -> Result<Self> {
        let image = DecodedImage::new(pixels, width, height)?;
        Ok(Self::from_decoded(image, timestamp))
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// PNG encoding, used by the remote detector and for notification images.
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let image = RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))?;
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .context("encode frame as PNG")?;
        Ok(out.into_inner())
    }
}
