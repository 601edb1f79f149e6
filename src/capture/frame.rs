//! Frame data structures for captured camera content

use anyhow::{Context, Result};
use image::RgbaImage;
use std::time::Instant;

/// A captured camera frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw RGBA pixel data
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Timestamp when frame was captured
    pub timestamp: Instant,
}

impl Frame {
    /// Create a new frame from RGBA bytes
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    /// Wrap a decoded RGBA image
    pub fn from_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// View the pixels as an image buffer, rejecting malformed buffers
    pub fn to_image(&self) -> Result<RgbaImage> {
        if self.width == 0 || self.height == 0 {
            anyhow::bail!("Frame has zero area ({}x{})", self.width, self.height);
        }
        RgbaImage::from_raw(self.width, self.height, self.data.clone()).with_context(|| {
            format!(
                "Frame buffer of {} bytes does not match {}x{} RGBA",
                self.data.len(),
                self.width,
                self.height
            )
        })
    }
}
