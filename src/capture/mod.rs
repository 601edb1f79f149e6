//! Frame Capture Layer
//!
//! The engine only needs frames on demand. Camera integration lives outside
//! this crate; `DirectoryFrameSource` replays still images for testing and
//! offline scanning.

pub mod frame;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::vision::decode_image;

pub use frame::Frame;

/// Anything that can supply frames on demand
pub trait FrameSource: Send {
    /// Capture the next frame, or `None` when the source is exhausted
    fn capture_frame(&mut self) -> Result<Option<Frame>>;
}

/// Image file extensions picked up by the directory source
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

/// Replays image files from a directory in name order
pub struct DirectoryFrameSource {
    files: Vec<PathBuf>,
    position: usize,
    looping: bool,
}

impl DirectoryFrameSource {
    /// Scan a directory for image files
    pub fn new(dir: &Path, looping: bool) -> Result<Self> {
        let files = list_images(dir)?;
        info!("Frame source: {} images in {:?}", files.len(), dir);
        Ok(Self {
            files,
            position: 0,
            looping,
        })
    }

    /// Number of frames in one pass
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the directory contained no images
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirectoryFrameSource {
    fn capture_frame(&mut self) -> Result<Option<Frame>> {
        let mut attempts = 0;
        loop {
            if attempts > self.files.len() {
                anyhow::bail!("No readable frames left in the frame directory");
            }
            attempts += 1;

            if self.position >= self.files.len() {
                if !self.looping || self.files.is_empty() {
                    return Ok(None);
                }
                self.position = 0;
            }

            let path = &self.files[self.position];
            self.position += 1;

            match decode_image(path) {
                Ok(image) => {
                    debug!("Captured frame from {:?}", path);
                    return Ok(Some(Frame::from_image(image)));
                }
                Err(e) => warn!("Skipping unreadable frame {:?}: {:#}", path, e),
            }
        }
    }
}

/// List image files in a directory, sorted by name
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read frame directory: {:?}", dir))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}
