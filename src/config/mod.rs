//! Application Configuration
//!
//! Detection tuning and scheduling settings stored in TOML format.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::EngineError;
use crate::vision::DetectionMethod;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Method selection and scheduling
    pub detection: DetectionSettings,
    /// Raster-signature matcher settings
    pub signature: SignatureSettings,
    /// Keypoint / template matcher settings
    pub keypoint: KeypointSettings,
    /// Text matcher settings
    pub text: TextSettings,
    /// Fusion combiner coefficients
    pub fusion: FusionSettings,
    /// Stability tracker settings
    pub stability: StabilitySettings,
    /// Reference loading settings
    pub references: ReferenceSettings,
}

impl AppConfig {
    /// Check every value against its domain
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::InvalidConfig(msg.to_string()));

        if self.detection.interval_ms == 0 {
            return invalid("detection.interval_ms must be greater than zero");
        }
        if !(200..=500).contains(&self.detection.interval_ms) {
            warn!(
                "detection.interval_ms = {} is outside the 2-5 detections per second target",
                self.detection.interval_ms
            );
        }

        let sig = &self.signature;
        if sig.grid_size == 0 || sig.block_size == 0 {
            return invalid("signature.grid_size and signature.block_size must be non-zero");
        }
        if sig.grid_size % sig.block_size != 0 {
            return invalid("signature.block_size must divide signature.grid_size");
        }
        if sig.grid_size < 2 {
            return invalid("signature.grid_size must be at least 2 for edge sampling");
        }

        let kp = &self.keypoint;
        if !(kp.ratio_threshold > 0.0 && kp.ratio_threshold <= 1.0) {
            return invalid("keypoint.ratio_threshold must be in (0, 1]");
        }
        if kp.min_correspondences == 0 {
            return invalid("keypoint.min_correspondences must be at least 1");
        }
        if kp.distance_norm <= 0.0 {
            return invalid("keypoint.distance_norm must be positive");
        }
        if kp.working_size < 64 || kp.template_size == 0 || kp.scan_stride == 0 {
            return invalid("keypoint.working_size must be >= 64, template_size and scan_stride non-zero");
        }

        let text = &self.text;
        if text.timeout_ms == 0 {
            return invalid("text.timeout_ms must be greater than zero");
        }
        if !(0.0..=1.0).contains(&text.min_similarity) {
            return invalid("text.min_similarity must be in [0, 1]");
        }
        if text.length_norm == 0 {
            return invalid("text.length_norm must be greater than zero");
        }

        if !(0.0..=1.0).contains(&self.fusion.conflict_penalty) {
            return invalid("fusion.conflict_penalty must be in [0, 1]");
        }

        if self.stability.confirm_frames == 0 || self.stability.hide_delay == 0 {
            return invalid("stability.confirm_frames and stability.hide_delay must be at least 1");
        }

        Ok(())
    }
}

/// Method selection and frame-loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Active detection method
    pub method: DetectionMethod,
    /// Milliseconds between detection ticks
    pub interval_ms: u64,
    /// Default product catalog when none is given on the command line
    pub catalog_path: Option<PathBuf>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            method: DetectionMethod::Hybrid,
            interval_ms: 333,
            catalog_path: None,
        }
    }
}

/// Raster-signature matcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureSettings {
    /// Side of the square grid frames are downsampled to
    pub grid_size: u32,
    /// Side of one brightness block inside the grid
    pub block_size: u32,
    pub signature_weight: f32,
    pub color_weight: f32,
    pub edge_weight: f32,
}

impl Default for SignatureSettings {
    fn default() -> Self {
        Self {
            grid_size: 32,
            block_size: 4,
            signature_weight: 0.5,
            color_weight: 0.3,
            edge_weight: 0.2,
        }
    }
}

/// Backend used by the keypoint matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeypointBackend {
    /// FAST corners with binary descriptors
    #[default]
    Features,
    /// Direct normalized cross-correlation scan
    TemplateScan,
}

/// Keypoint / template matcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeypointSettings {
    pub backend: KeypointBackend,
    /// Nearest / second-nearest distance ratio a correspondence must beat
    pub ratio_threshold: f32,
    /// Filtered correspondences a reference needs before it counts
    pub min_correspondences: usize,
    pub distance_weight: f32,
    pub count_weight: f32,
    /// Hamming distance that maps to a distance score of zero
    pub distance_norm: f32,
    /// FAST corner intensity threshold
    pub fast_threshold: u8,
    /// Strongest corners kept per image
    pub max_keypoints: usize,
    /// Longest side of images used for feature extraction and scanning
    pub working_size: u32,
    /// Longest side of reference images for template scanning
    pub template_size: u32,
    /// Pixel step of the template scan
    pub scan_stride: u32,
}

impl Default for KeypointSettings {
    fn default() -> Self {
        Self {
            backend: KeypointBackend::Features,
            ratio_threshold: 0.9,
            min_correspondences: 3,
            distance_weight: 0.7,
            count_weight: 0.3,
            distance_norm: 128.0,
            fast_threshold: 20,
            max_keypoints: 500,
            working_size: 320,
            template_size: 96,
            scan_stride: 2,
        }
    }
}

/// External text-recognition engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEngine {
    /// Pipe frames through the tesseract executable
    #[default]
    Tesseract,
    /// Never recognize any text
    None,
}

/// Text matcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextSettings {
    pub engine: TextEngine,
    /// Executable invoked for the tesseract engine
    pub command: String,
    /// Recognition language passed to the engine
    pub language: String,
    /// Upper bound for one recognition call
    pub timeout_ms: u64,
    /// Minimum fuzzy similarity for a keyword to count as matched
    pub min_similarity: f32,
    /// Similarity assigned when one word contains the other
    pub containment_similarity: f32,
    pub score_weight: f32,
    pub coverage_weight: f32,
    pub length_weight: f32,
    /// Text length (chars) at which the length term saturates
    pub length_norm: usize,
}

impl Default for TextSettings {
    fn default() -> Self {
        Self {
            engine: TextEngine::Tesseract,
            command: "tesseract".to_string(),
            language: "eng".to_string(),
            timeout_ms: 10_000,
            min_similarity: 0.6,
            containment_similarity: 0.8,
            score_weight: 0.7,
            coverage_weight: 0.2,
            length_weight: 0.1,
            length_norm: 50,
        }
    }
}

/// Fusion combiner coefficients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionSettings {
    /// Weight of the higher-priority method when both agree
    pub primary_weight: f32,
    /// Weight of the other method when both agree
    pub secondary_weight: f32,
    pub agreement_bonus: f32,
    pub high_confidence_bonus: f32,
    /// Primary confidence above which the high-confidence bonus may apply
    pub primary_high_mark: f32,
    /// Secondary confidence above which the high-confidence bonus may apply
    pub secondary_high_mark: f32,
    /// Multiplier applied to both sides of a disagreement
    pub conflict_penalty: f32,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            primary_weight: 0.7,
            secondary_weight: 0.3,
            agreement_bonus: 0.15,
            high_confidence_bonus: 0.10,
            primary_high_mark: 0.8,
            secondary_high_mark: 0.6,
            conflict_penalty: 0.8,
        }
    }
}

/// Stability tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilitySettings {
    /// Consecutive frames naming a product before it is confirmed.
    ///
    /// A switch from another product spends its first frame on the
    /// clear event, so with 1 the new product is confirmed one frame later.
    pub confirm_frames: u32,
    /// Consecutive empty frames before a confirmed product is cleared
    pub hide_delay: u32,
}

impl Default for StabilitySettings {
    fn default() -> Self {
        Self {
            confirm_frames: 3,
            hide_delay: 5,
        }
    }
}

/// Reference loading settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceSettings {
    /// Derive lighting, color, focus, rotation and scale variants from every reference image
    pub augment: bool,
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
