//! Keypoint matching
//!
//! Precise matching through local keypoint correspondences. FAST corners are
//! described with 256-bit binary tests on a smoothed patch and matched by
//! Hamming distance with a nearest/second-nearest ratio test.
//!
//! The same matcher can instead run a direct template scan; both backends
//! report the same candidate shape.

use anyhow::Result;
use image::{DynamicImage, GrayImage};
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::debug;

use crate::capture::Frame;
use crate::config::{KeypointBackend, KeypointSettings};
use crate::vision::references::{ReferenceDescriptor, ReferenceStore};
use crate::vision::template_scan;
use crate::vision::{clamp_unit, fit_within, working_gray, CandidateDetails, MatchCandidate, MatchMethod};

/// Bytes in one binary descriptor
pub const DESCRIPTOR_BYTES: usize = 32;

/// Half-size of the sampling patch around a keypoint
const PATCH_RADIUS: u32 = 15;

/// Smoothing applied before binary tests
const DESCRIPTOR_SIGMA: f32 = 2.0;

pub type BinaryDescriptor = [u8; DESCRIPTOR_BYTES];

/// Keypoints of one image with their descriptors (same order)
#[derive(Debug, Clone, Default)]
pub struct KeypointSet {
    pub keypoints: Vec<(u32, u32)>,
    pub descriptors: Vec<BinaryDescriptor>,
}

impl KeypointSet {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Proposed match between a frame keypoint and a reference keypoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correspondence {
    /// Index into the frame set
    pub query: usize,
    /// Index into the reference set
    pub train: usize,
    pub distance: u32,
    /// Distance of the runner-up, if the reference had more than one keypoint
    pub second_distance: Option<u32>,
}

impl Correspondence {
    /// Ratio test against the runner-up
    pub fn passes_ratio(&self, ratio: f32) -> bool {
        match self.second_distance {
            Some(second) => (self.distance as f32) < ratio * second as f32,
            None => true,
        }
    }
}

/// Keypoint detection and descriptor matching capability
pub trait FeatureLibrary: Send + Sync {
    fn detect_and_describe(&self, image: &GrayImage) -> KeypointSet;
    fn match_descriptors(&self, query: &KeypointSet, train: &KeypointSet) -> Vec<Correspondence>;
}

/// FAST-9 corners with binary intensity-test descriptors
pub struct FastBrief {
    fast_threshold: u8,
    max_keypoints: usize,
}

impl FastBrief {
    pub fn new(settings: &KeypointSettings) -> Self {
        Self {
            fast_threshold: settings.fast_threshold,
            max_keypoints: settings.max_keypoints,
        }
    }
}

impl FeatureLibrary for FastBrief {
    fn detect_and_describe(&self, image: &GrayImage) -> KeypointSet {
        let (w, h) = image.dimensions();
        let mut set = KeypointSet::default();
        if w <= 2 * PATCH_RADIUS || h <= 2 * PATCH_RADIUS {
            return set;
        }

        let mut corners = corners_fast9(image, self.fast_threshold);
        corners.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        let smoothed = gaussian_blur_f32(image, DESCRIPTOR_SIGMA);
        for corner in corners {
            if set.len() >= self.max_keypoints {
                break;
            }
            if corner.x < PATCH_RADIUS
                || corner.y < PATCH_RADIUS
                || corner.x + PATCH_RADIUS >= w
                || corner.y + PATCH_RADIUS >= h
            {
                continue;
            }
            set.keypoints.push((corner.x, corner.y));
            set.descriptors.push(describe(&smoothed, corner.x, corner.y));
        }

        set
    }

    fn match_descriptors(&self, query: &KeypointSet, train: &KeypointSet) -> Vec<Correspondence> {
        if train.is_empty() {
            return Vec::new();
        }

        query
            .descriptors
            .iter()
            .enumerate()
            .map(|(qi, q)| {
                let mut best = (usize::MAX, u32::MAX);
                let mut second = u32::MAX;
                for (ti, t) in train.descriptors.iter().enumerate() {
                    let d = hamming_distance(q, t);
                    if d < best.1 {
                        second = best.1;
                        best = (ti, d);
                    } else if d < second {
                        second = d;
                    }
                }
                Correspondence {
                    query: qi,
                    train: best.0,
                    distance: best.1,
                    second_distance: (second != u32::MAX).then_some(second),
                }
            })
            .collect()
    }
}

/// Fixed sampling pattern: 256 point pairs inside the patch
fn sampling_pattern() -> &'static [[i32; 4]; 256] {
    static PATTERN: OnceLock<[[i32; 4]; 256]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut state: u32 = 0x9E37_79B9;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state % (2 * PATCH_RADIUS + 1)) as i32 - PATCH_RADIUS as i32
        };
        let mut pattern = [[0i32; 4]; 256];
        for pair in pattern.iter_mut() {
            for offset in pair.iter_mut() {
                *offset = next();
            }
        }
        pattern
    })
}

/// Binary descriptor of the patch centred on (x, y); the caller keeps the patch in bounds
fn describe(smoothed: &GrayImage, x: u32, y: u32) -> BinaryDescriptor {
    let mut descriptor = [0u8; DESCRIPTOR_BYTES];
    let sample = |dx: i32, dy: i32| {
        smoothed
            .get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)
            .0[0]
    };

    for (i, p) in sampling_pattern().iter().enumerate() {
        if sample(p[0], p[1]) < sample(p[2], p[3]) {
            descriptor[i / 8] |= 1 << (i % 8);
        }
    }
    descriptor
}

/// Number of differing bits
pub fn hamming_distance(a: &BinaryDescriptor, b: &BinaryDescriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Score of one reference against the current frame
#[derive(Debug, Clone)]
struct ReferenceScore {
    /// Unweighted confidence
    confidence: f32,
    correspondences: usize,
    position: Option<(u32, u32)>,
}

#[derive(Default)]
struct ProductScore<'a> {
    weighted: f32,
    weight: f32,
    contributing: usize,
    correspondences: usize,
    best_reference: Option<(&'a str, f32, (u32, u32))>,
}

/// Keypoint matcher
pub struct KeypointMatcher {
    settings: KeypointSettings,
    library: Arc<dyn FeatureLibrary>,
    /// Reference keypoints, extracted on first use
    features: Mutex<HashMap<u64, Arc<KeypointSet>>>,
    /// Reference templates for the scan backend
    templates: Mutex<HashMap<u64, Arc<GrayImage>>>,
}

impl KeypointMatcher {
    /// Create a matcher using the built-in feature library
    pub fn new(settings: KeypointSettings) -> Self {
        let library = Arc::new(FastBrief::new(&settings));
        Self::with_library(settings, library)
    }

    /// Create a matcher with a custom feature library
    pub fn with_library(settings: KeypointSettings, library: Arc<dyn FeatureLibrary>) -> Self {
        Self {
            settings,
            library,
            features: Mutex::new(HashMap::new()),
            templates: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> KeypointBackend {
        self.settings.backend
    }

    /// Drop every cached reference keypoint set and template
    pub fn release_cache(&self) {
        self.features.lock().clear();
        self.templates.lock().clear();
    }

    /// Number of references with cached derived data
    pub fn cached_references(&self) -> usize {
        self.features.lock().len() + self.templates.lock().len()
    }

    /// Best product above its own threshold, if any
    pub fn detect(&self, frame: &Frame, store: &ReferenceStore) -> Result<Option<MatchCandidate>> {
        let start = Instant::now();
        let gray = working_gray(&frame.to_image()?, self.settings.working_size);

        let frame_set = match self.settings.backend {
            KeypointBackend::Features => {
                let set = self.library.detect_and_describe(&gray);
                if set.is_empty() {
                    debug!("No keypoints found in frame");
                    return Ok(None);
                }
                Some(set)
            }
            KeypointBackend::TemplateScan => None,
        };

        let jobs: Vec<_> = store
            .products()
            .flat_map(|product| product.references.iter().map(move |r| (product, r)))
            .collect();

        let scores: Vec<Option<ReferenceScore>> = jobs
            .par_iter()
            .map(|(_, reference)| match &frame_set {
                Some(set) => self.score_features(set, reference),
                None => self.score_template(&gray, reference),
            })
            .collect();

        let mut per_product: HashMap<&str, ProductScore> = HashMap::new();
        for ((product, reference), score) in jobs.iter().zip(scores) {
            let Some(score) = score else { continue };
            let entry = per_product.entry(product.product_id.as_str()).or_default();
            entry.weighted += score.confidence * reference.weight;
            entry.weight += reference.weight;
            entry.contributing += 1;
            entry.correspondences += score.correspondences;
            let better = entry.best_reference.map_or(true, |(_, s, _)| score.confidence > s);
            if better {
                entry.best_reference = Some((
                    reference.id.as_str(),
                    score.confidence,
                    score.position.unwrap_or((0, 0)),
                ));
            }
        }

        let mut best: Option<(f32, MatchCandidate)> = None;
        for product in store.products() {
            let Some(score) = per_product.get(product.product_id.as_str()) else { continue };
            if score.weight <= 0.0 {
                continue;
            }
            let confidence = clamp_unit(score.weighted / score.weight);
            debug!(
                "Keypoint score for '{}': {:.3} ({} references, {} correspondences)",
                product.product_id, confidence, score.contributing, score.correspondences
            );

            if best.as_ref().map_or(true, |(_, b)| confidence > b.confidence) {
                let details = match (self.settings.backend, score.best_reference) {
                    (KeypointBackend::TemplateScan, Some((id, _, position))) => CandidateDetails::TemplateScan {
                        position,
                        best_reference: id.to_string(),
                    },
                    _ => CandidateDetails::Keypoint {
                        contributing_references: score.contributing,
                        correspondences: score.correspondences,
                    },
                };
                let candidate = MatchCandidate::new(product.product_id.clone(), confidence, MatchMethod::Keypoint, details);
                best = Some((product.confidence_threshold, candidate));
            }
        }

        debug!(
            "Keypoint matching ({:?}) complete in {:?}",
            self.settings.backend,
            start.elapsed()
        );
        Ok(best.and_then(|(threshold, candidate)| (candidate.confidence > threshold).then_some(candidate)))
    }

    fn score_features(&self, frame_set: &KeypointSet, reference: &ReferenceDescriptor) -> Option<ReferenceScore> {
        let reference_set = self.reference_features(reference);
        if reference_set.is_empty() {
            return None;
        }

        let good: Vec<Correspondence> = self
            .library
            .match_descriptors(frame_set, &reference_set)
            .into_iter()
            .filter(|c| c.passes_ratio(self.settings.ratio_threshold))
            .collect();

        if good.len() < self.settings.min_correspondences {
            return None;
        }

        let average = good.iter().map(|c| c.distance as f32).sum::<f32>() / good.len() as f32;
        let distance_score = clamp_unit(1.0 - average / self.settings.distance_norm);
        let smaller = frame_set.len().min(reference_set.len()).max(1);
        let count_ratio = clamp_unit(good.len() as f32 / smaller as f32);

        Some(ReferenceScore {
            confidence: clamp_unit(
                self.settings.distance_weight * distance_score + self.settings.count_weight * count_ratio,
            ),
            correspondences: good.len(),
            position: None,
        })
    }

    fn score_template(&self, frame: &GrayImage, reference: &ReferenceDescriptor) -> Option<ReferenceScore> {
        let template = self.reference_template(reference);
        match template_scan::scan(frame, &template, self.settings.scan_stride) {
            Some(found) => Some(ReferenceScore {
                confidence: clamp_unit(found.score),
                correspondences: 0,
                position: Some(found.position),
            }),
            None => {
                debug!(
                    "Reference '{}' ({}x{}) is larger than the frame, skipped",
                    reference.id,
                    template.width(),
                    template.height()
                );
                None
            }
        }
    }

    fn reference_features(&self, reference: &ReferenceDescriptor) -> Arc<KeypointSet> {
        if let Some(cached) = self.features.lock().get(&reference.key) {
            return cached.clone();
        }
        let gray = DynamicImage::ImageRgba8((*reference.raster).clone()).to_luma8();
        let set = Arc::new(self.library.detect_and_describe(&gray));
        self.features.lock().insert(reference.key, set.clone());
        set
    }

    fn reference_template(&self, reference: &ReferenceDescriptor) -> Arc<GrayImage> {
        if let Some(cached) = self.templates.lock().get(&reference.key) {
            return cached.clone();
        }
        let scaled = fit_within(&reference.raster, self.settings.template_size);
        let template = Arc::new(DynamicImage::ImageRgba8(scaled).to_luma8());
        self.templates.lock().insert(reference.key, template.clone());
        template
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::vision::references::test_support::{store_with, store_with_config};
    use image::{Rgba, RgbaImage};

    /// Blocky pseudo-random texture, rich in corners
    fn texture(width: u32, height: u32, seed: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            let mut h = (x / 6).wrapping_mul(73_856_093) ^ (y / 6).wrapping_mul(19_349_663) ^ seed;
            h ^= h >> 13;
            h = h.wrapping_mul(0x5bd1_e995);
            h ^= h >> 15;
            let v = (h % 256) as u8;
            Rgba([v, v, v, 255])
        })
    }

    #[test]
    fn test_hamming_distance() {
        let a = [0u8; DESCRIPTOR_BYTES];
        let mut b = [0u8; DESCRIPTOR_BYTES];
        assert_eq!(hamming_distance(&a, &b), 0);
        b[0] = 0b1011;
        b[31] = 0xFF;
        assert_eq!(hamming_distance(&a, &b), 11);
    }

    #[test]
    fn test_ratio_test() {
        let c = Correspondence { query: 0, train: 0, distance: 10, second_distance: Some(20) };
        assert!(c.passes_ratio(0.9));
        assert!(!c.passes_ratio(0.5));

        let ambiguous = Correspondence { query: 0, train: 0, distance: 19, second_distance: Some(20) };
        assert!(!ambiguous.passes_ratio(0.9));

        let lone = Correspondence { query: 0, train: 0, distance: 60, second_distance: None };
        assert!(lone.passes_ratio(0.1));
    }

    #[test]
    fn test_sampling_pattern_stays_in_patch() {
        let radius = PATCH_RADIUS as i32;
        for pair in sampling_pattern() {
            assert!(pair.iter().all(|v| (-radius..=radius).contains(v)));
        }
    }

    #[test]
    fn test_identical_images_match_exactly() {
        let library = FastBrief::new(&KeypointSettings::default());
        let gray = DynamicImage::ImageRgba8(texture(160, 120, 7)).to_luma8();
        let set = library.detect_and_describe(&gray);
        assert!(set.len() > 10, "texture should produce keypoints, got {}", set.len());

        let matches = library.match_descriptors(&set, &set);
        assert_eq!(matches.len(), set.len());
        assert!(matches.iter().all(|c| c.distance == 0));
    }

    #[test]
    fn test_detect_prefers_matching_product() {
        let store = store_with(&[
            ("seven", 0.5, vec![texture(160, 120, 7)]),
            ("eleven", 0.5, vec![texture(160, 120, 11)]),
        ]);
        let matcher = KeypointMatcher::new(KeypointSettings::default());

        let frame = Frame::from_image(texture(160, 120, 7));
        let candidate = matcher.detect(&frame, &store).unwrap().unwrap();
        assert_eq!(candidate.product_id, "seven");
        assert_eq!(candidate.method, MatchMethod::Keypoint);
        assert!(candidate.confidence > 0.8, "confidence {}", candidate.confidence);
        assert!(matches!(candidate.details, CandidateDetails::Keypoint { contributing_references: 1, .. }));
    }

    #[test]
    fn test_detect_does_not_fall_back_to_runner_up() {
        // Shares the left half of "seven", so it scores lower but still matches
        let seven = texture(160, 120, 7);
        let eleven = texture(160, 120, 11);
        let partial = RgbaImage::from_fn(160, 120, |x, y| {
            if x < 80 {
                *seven.get_pixel(x, y)
            } else {
                *eleven.get_pixel(x, y)
            }
        });
        let matcher = KeypointMatcher::new(KeypointSettings::default());
        let frame = Frame::from_image(seven.clone());

        let store = store_with(&[("partial", 0.0, vec![partial.clone()])]);
        assert!(matcher.detect(&frame, &store).unwrap().is_some());

        let store = store_with(&[("seven", 1.0, vec![seven.clone()]), ("partial", 0.0, vec![partial.clone()])]);
        assert!(matcher.detect(&frame, &store).unwrap().is_none());

        let store = store_with(&[("seven", 0.5, vec![seven]), ("partial", 0.0, vec![partial])]);
        assert_eq!(matcher.detect(&frame, &store).unwrap().unwrap().product_id, "seven");
    }

    #[test]
    fn test_flat_frame_yields_no_candidate() {
        let store = store_with(&[("seven", 0.5, vec![texture(160, 120, 7)])]);
        let matcher = KeypointMatcher::new(KeypointSettings::default());

        let frame = Frame::from_image(RgbaImage::from_pixel(160, 120, Rgba([90, 90, 90, 255])));
        assert!(matcher.detect(&frame, &store).unwrap().is_none());
    }

    #[test]
    fn test_min_correspondences_gate() {
        let store = store_with(&[("seven", 0.0, vec![texture(160, 120, 7)])]);
        let settings = KeypointSettings {
            min_correspondences: 100_000,
            ..KeypointSettings::default()
        };
        let matcher = KeypointMatcher::new(settings);

        let frame = Frame::from_image(texture(160, 120, 7));
        assert!(matcher.detect(&frame, &store).unwrap().is_none());
    }

    #[test]
    fn test_reference_cache_and_release() {
        let store = store_with(&[
            ("seven", 0.5, vec![texture(160, 120, 7)]),
            ("eleven", 0.5, vec![texture(160, 120, 11)]),
        ]);
        let matcher = KeypointMatcher::new(KeypointSettings::default());
        assert_eq!(matcher.cached_references(), 0);

        matcher.detect(&Frame::from_image(texture(160, 120, 7)), &store).unwrap();
        assert_eq!(matcher.cached_references(), 2);

        matcher.detect(&Frame::from_image(texture(160, 120, 11)), &store).unwrap();
        assert_eq!(matcher.cached_references(), 2);

        matcher.release_cache();
        assert_eq!(matcher.cached_references(), 0);
    }

    #[test]
    fn test_template_scan_backend_finds_crop() {
        let frame_image = texture(200, 150, 3);
        let crop = image::imageops::crop_imm(&frame_image, 60, 42, 60, 48).to_image();

        let mut config = AppConfig::default();
        config.keypoint.backend = KeypointBackend::TemplateScan;
        let store = store_with_config(&config, &[("crop", 0.8, vec![crop])]);
        let matcher = KeypointMatcher::new(config.keypoint.clone());

        let candidate = matcher.detect(&Frame::from_image(frame_image), &store).unwrap().unwrap();
        assert_eq!(candidate.product_id, "crop");
        assert!(candidate.confidence > 0.99);
        match candidate.details {
            CandidateDetails::TemplateScan { position, best_reference } => {
                assert_eq!(position, (60, 42));
                assert_eq!(best_reference, "ref0");
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_template_scan_rejects_reference_larger_than_frame() {
        let mut config = AppConfig::default();
        config.keypoint.backend = KeypointBackend::TemplateScan;
        let store = store_with_config(&config, &[("big", 0.0, vec![texture(96, 96, 5)])]);
        let matcher = KeypointMatcher::new(config.keypoint.clone());

        let frame = Frame::from_image(texture(80, 60, 5));
        assert!(matcher.detect(&frame, &store).unwrap().is_none());
    }
}
