//! Text recognition
//!
//! The engine treats text recognition as an external collaborator with
//! unbounded latency. Every call is wrapped in a timeout; a timeout or a
//! recognizer failure is the same as finding no text.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::capture::Frame;
use crate::config::{TextEngine, TextSettings};

/// Extracts raw text from a frame
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, frame: &Frame) -> Result<String>;
}

/// Runs the `tesseract` CLI, feeding it a PNG on stdin
pub struct TesseractRecognizer {
    command: String,
    language: String,
}

impl TesseractRecognizer {
    pub fn new(settings: &TextSettings) -> Self {
        Self {
            command: settings.command.clone(),
            language: settings.language.clone(),
        }
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    async fn recognize(&self, frame: &Frame) -> Result<String> {
        let png = encode_png(frame)?;

        let mut child = Command::new(&self.command)
            .args(["stdin", "stdout", "-l", self.language.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start text recognizer '{}'", self.command))?;

        let mut stdin = child.stdin.take().context("Recognizer stdin unavailable")?;
        let feed = async move {
            stdin.write_all(&png).await?;
            stdin.shutdown().await
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.context("Text recognizer did not complete")?;
        fed.context("Failed to send frame to text recognizer")?;

        if !output.status.success() {
            bail!(
                "Text recognizer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Recognizer for setups without a text engine
pub struct NoTextRecognizer;

#[async_trait]
impl TextRecognizer for NoTextRecognizer {
    async fn recognize(&self, _frame: &Frame) -> Result<String> {
        Ok(String::new())
    }
}

/// Recognizer selected by configuration
pub fn recognizer_for(settings: &TextSettings) -> Arc<dyn TextRecognizer> {
    match settings.engine {
        TextEngine::Tesseract => Arc::new(TesseractRecognizer::new(settings)),
        TextEngine::None => Arc::new(NoTextRecognizer),
    }
}

/// Recognize text under a deadline; `None` on timeout or failure
pub async fn recognize_with_timeout(
    recognizer: &dyn TextRecognizer,
    frame: &Frame,
    timeout: Duration,
) -> Option<String> {
    match tokio::time::timeout(timeout, recognizer.recognize(frame)).await {
        Ok(Ok(text)) => {
            debug!("Recognized {} characters of text", text.chars().count());
            Some(text)
        }
        Ok(Err(e)) => {
            warn!("Text recognition failed: {:#}", e);
            None
        }
        Err(_) => {
            warn!("Text recognition timed out after {:?}", timeout);
            None
        }
    }
}

fn encode_png(frame: &Frame) -> Result<Vec<u8>> {
    let image = frame.to_image()?;
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("Failed to encode frame as PNG")?;
    Ok(bytes)
}
