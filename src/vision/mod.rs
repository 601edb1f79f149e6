//! Vision Layer
//!
//! Per-method product matching on captured frames. Three independent matchers
//! share the same reference store and report the same candidate shape:
//! - Raster signatures (cheap, coarse)
//! - Keypoint correspondences or template scanning (precise)
//! - Recognized text against product keywords

pub mod augment;
pub mod keypoints;
pub mod ocr;
pub mod references;
pub mod signature;
pub mod template_scan;
pub mod text_match;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::EngineError;

pub use keypoints::KeypointMatcher;
pub use ocr::{NoTextRecognizer, TesseractRecognizer, TextRecognizer};
pub use references::{ProductRegistration, ReferenceDescriptor, ReferenceStore};
pub use signature::SignatureMatcher;
pub use text_match::TextMatcher;

/// Method that produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Signature,
    Keypoint,
    Text,
}

impl MatchMethod {
    /// Fusion priority; the higher-priority method of a pair is the primary
    pub fn priority(self) -> u8 {
        match self {
            MatchMethod::Keypoint => 2,
            MatchMethod::Signature => 1,
            MatchMethod::Text => 0,
        }
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchMethod::Signature => "signature",
            MatchMethod::Keypoint => "keypoint",
            MatchMethod::Text => "text",
        };
        f.write_str(name)
    }
}

/// Detection strategy selected for a scanning session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Signature,
    Keypoint,
    Text,
    /// Keypoint and text matchers run together and are fused
    #[default]
    Hybrid,
}

impl DetectionMethod {
    /// Matchers this strategy runs each cycle
    pub fn matchers(self) -> &'static [MatchMethod] {
        match self {
            DetectionMethod::Signature => &[MatchMethod::Signature],
            DetectionMethod::Keypoint => &[MatchMethod::Keypoint],
            DetectionMethod::Text => &[MatchMethod::Text],
            DetectionMethod::Hybrid => &[MatchMethod::Keypoint, MatchMethod::Text],
        }
    }
}

impl FromStr for DetectionMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signature" => Ok(DetectionMethod::Signature),
            "keypoint" | "template" => Ok(DetectionMethod::Keypoint),
            "text" | "ocr" => Ok(DetectionMethod::Text),
            "hybrid" => Ok(DetectionMethod::Hybrid),
            _ => Err(EngineError::UnknownMethod(s.to_string())),
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectionMethod::Signature => "signature",
            DetectionMethod::Keypoint => "keypoint",
            DetectionMethod::Text => "text",
            DetectionMethod::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

/// Method-specific evidence attached to a candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateDetails {
    Signature {
        /// References that were scored
        references: usize,
    },
    Keypoint {
        /// References with enough correspondences
        contributing_references: usize,
        /// Filtered correspondences across contributing references
        correspondences: usize,
    },
    TemplateScan {
        /// Best correlation position (x, y) in working coordinates
        position: (u32, u32),
        best_reference: String,
    },
    Text {
        matched_keywords: Vec<String>,
        recognized_text: String,
    },
}

/// One method's opinion about which product is in a frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub product_id: String,
    /// Always within [0, 1]
    pub confidence: f32,
    pub method: MatchMethod,
    pub details: CandidateDetails,
}

impl MatchCandidate {
    pub fn new(
        product_id: impl Into<String>,
        confidence: f32,
        method: MatchMethod,
        details: CandidateDetails,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            confidence: clamp_unit(confidence),
            method,
            details,
        }
    }
}

/// Clamp a score into [0, 1], mapping NaN to 0
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Decode an image file to RGBA
pub fn decode_image(path: &Path) -> Result<RgbaImage> {
    let img = image::open(path)
        .with_context(|| format!("Failed to load image: {:?}", path))?;
    Ok(img.to_rgba8())
}

/// Resize to exact dimensions
pub fn resize(image: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    image::imageops::resize(image, width.max(1), height.max(1), FilterType::Triangle)
}

/// Scale so the longest side is at most `max_side`, keeping aspect ratio
pub fn fit_within(image: &RgbaImage, max_side: u32) -> RgbaImage {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if longest <= max_side {
        return image.clone();
    }
    let scale = max_side as f32 / longest as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    resize(image, new_w, new_h)
}

/// Grayscale copy at working resolution
pub fn working_gray(image: &RgbaImage, max_side: u32) -> GrayImage {
    DynamicImage::ImageRgba8(fit_within(image, max_side)).to_luma8()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_method_from_str() {
        assert_eq!("hybrid".parse::<DetectionMethod>().unwrap(), DetectionMethod::Hybrid);
        assert_eq!(" Signature ".parse::<DetectionMethod>().unwrap(), DetectionMethod::Signature);
        assert_eq!("template".parse::<DetectionMethod>().unwrap(), DetectionMethod::Keypoint);
        assert_eq!("ocr".parse::<DetectionMethod>().unwrap(), DetectionMethod::Text);

        let err = "lidar".parse::<DetectionMethod>().unwrap_err();
        assert_eq!(err, EngineError::UnknownMethod("lidar".to_string()));
    }

    #[test]
    fn test_hybrid_runs_keypoint_and_text() {
        assert_eq!(
            DetectionMethod::Hybrid.matchers(),
            &[MatchMethod::Keypoint, MatchMethod::Text]
        );
        assert!(MatchMethod::Keypoint.priority() > MatchMethod::Text.priority());
    }

    #[test]
    fn test_candidate_confidence_is_clamped() {
        let details = CandidateDetails::Signature { references: 1 };
        assert_eq!(MatchCandidate::new("a", 1.7, MatchMethod::Signature, details.clone()).confidence, 1.0);
        assert_eq!(MatchCandidate::new("a", -0.2, MatchMethod::Signature, details.clone()).confidence, 0.0);
        assert_eq!(MatchCandidate::new("a", f32::NAN, MatchMethod::Signature, details).confidence, 0.0);
    }

    #[test]
    fn test_fit_within_keeps_aspect_ratio() {
        let image = RgbaImage::new(640, 320);
        let fitted = fit_within(&image, 320);
        assert_eq!(fitted.dimensions(), (320, 160));

        let small = RgbaImage::new(100, 50);
        assert_eq!(fit_within(&small, 320).dimensions(), (100, 50));
    }
}
