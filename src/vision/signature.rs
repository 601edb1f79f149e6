//! Raster signature matching
//!
//! Cheapest of the three matchers. Frames and references are squashed onto a
//! small fixed grid and compared through three coarse descriptors: block
//! brightness, mean color, and edge strength.

use anyhow::Result;
use image::RgbaImage;
use std::time::Instant;
use tracing::debug;

use crate::capture::Frame;
use crate::config::SignatureSettings;
use crate::vision::references::ReferenceStore;
use crate::vision::{clamp_unit, resize, CandidateDetails, MatchCandidate, MatchMethod};

/// Largest possible edge strength (two neighbour differences of 255)
const EDGE_RANGE: f32 = 510.0;

/// Mean red/green/blue over the grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorProfile {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

/// Summary of edge strengths over interior grid pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeProfile {
    pub average: f32,
    pub maximum: f32,
}

/// Coarse descriptor of one image
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureDescriptor {
    /// Mean brightness of each block, row-major
    pub blocks: Vec<f32>,
    pub color: ColorProfile,
    pub edges: EdgeProfile,
}

impl SignatureDescriptor {
    /// Compute the descriptor of an RGBA image
    pub fn compute(image: &RgbaImage, settings: &SignatureSettings) -> Self {
        let grid = settings.grid_size.max(2);
        let block = settings.block_size.clamp(1, grid);
        let small = resize(image, grid, grid);

        let brightness = |x: u32, y: u32| -> f32 {
            let p = small.get_pixel(x, y).0;
            (p[0] as f32 + p[1] as f32 + p[2] as f32) / 3.0
        };

        let blocks_per_side = grid / block;
        let mut blocks = Vec::with_capacity((blocks_per_side * blocks_per_side) as usize);
        for by in 0..blocks_per_side {
            for bx in 0..blocks_per_side {
                let mut sum = 0.0;
                for y in by * block..(by + 1) * block {
                    for x in bx * block..(bx + 1) * block {
                        sum += brightness(x, y);
                    }
                }
                blocks.push(sum / (block * block) as f32);
            }
        }

        let (mut r, mut g, mut b) = (0.0f64, 0.0f64, 0.0f64);
        for p in small.pixels() {
            r += p.0[0] as f64;
            g += p.0[1] as f64;
            b += p.0[2] as f64;
        }
        let count = (grid * grid) as f64;
        let color = ColorProfile {
            r: (r / count) as f32,
            g: (g / count) as f32,
            b: (b / count) as f32,
        };

        let mut edge_sum = 0.0f64;
        let mut edge_max = 0.0f32;
        let mut samples = 0u32;
        for y in 0..grid - 1 {
            for x in 0..grid - 1 {
                let center = brightness(x, y);
                let strength = (center - brightness(x + 1, y)).abs()
                    + (center - brightness(x, y + 1)).abs();
                edge_sum += strength as f64;
                edge_max = edge_max.max(strength);
                samples += 1;
            }
        }
        let edges = EdgeProfile {
            average: if samples > 0 { (edge_sum / samples as f64) as f32 } else { 0.0 },
            maximum: edge_max,
        };

        Self { blocks, color, edges }
    }
}

/// Block-brightness similarity; vectors of different length compare as 0
pub fn signature_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let total: f32 = a.iter().zip(b).map(|(x, y)| (x - y).abs() / 255.0).sum();
    clamp_unit(1.0 - total / a.len() as f32)
}

/// Mean-color similarity
pub fn color_similarity(a: &ColorProfile, b: &ColorProfile) -> f32 {
    let diff = ((a.r - b.r).abs() + (a.g - b.g).abs() + (a.b - b.b).abs()) / (3.0 * 255.0);
    clamp_unit(1.0 - diff)
}

/// Edge-profile similarity
pub fn edge_similarity(a: &EdgeProfile, b: &EdgeProfile) -> f32 {
    let avg_diff = (a.average - b.average).abs() / EDGE_RANGE;
    let max_diff = (a.maximum - b.maximum).abs() / EDGE_RANGE;
    clamp_unit(1.0 - (avg_diff + max_diff) / 2.0)
}

/// Signature matcher
pub struct SignatureMatcher {
    settings: SignatureSettings,
}

impl SignatureMatcher {
    pub fn new(settings: SignatureSettings) -> Self {
        Self { settings }
    }

    /// Unweighted similarity of two descriptors
    pub fn similarity(&self, frame: &SignatureDescriptor, reference: &SignatureDescriptor) -> f32 {
        let s = &self.settings;
        clamp_unit(
            s.signature_weight * signature_similarity(&frame.blocks, &reference.blocks)
                + s.color_weight * color_similarity(&frame.color, &reference.color)
                + s.edge_weight * edge_similarity(&frame.edges, &reference.edges),
        )
    }

    /// Best-scoring product, if it also clears its own threshold
    pub fn detect(&self, frame: &Frame, store: &ReferenceStore) -> Result<Option<MatchCandidate>> {
        let start = Instant::now();
        let descriptor = SignatureDescriptor::compute(&frame.to_image()?, &self.settings);

        let mut best: Option<(f32, MatchCandidate)> = None;
        for product in store.products() {
            let mut score_sum = 0.0;
            let mut weight_sum = 0.0;
            for reference in &product.references {
                score_sum += self.similarity(&descriptor, &reference.signature) * reference.weight;
                weight_sum += reference.weight;
            }
            if weight_sum <= 0.0 {
                continue;
            }
            let confidence = clamp_unit(score_sum / weight_sum);
            debug!("Signature score for '{}': {:.3}", product.product_id, confidence);

            if best.as_ref().map_or(true, |(_, b)| confidence > b.confidence) {
                let candidate = MatchCandidate::new(
                    product.product_id.clone(),
                    confidence,
                    MatchMethod::Signature,
                    CandidateDetails::Signature {
                        references: product.references.len(),
                    },
                );
                best = Some((product.confidence_threshold, candidate));
            }
        }

        debug!("Signature matching complete in {:?}", start.elapsed());
        Ok(best.and_then(|(threshold, candidate)| (candidate.confidence > threshold).then_some(candidate)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::references::test_support::store_with;
    use image::Rgba;

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 90, 255])
        })
    }

    fn checker(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                Rgba([240, 240, 240, 255])
            } else {
                Rgba([20, 20, 20, 255])
            }
        })
    }

    #[test]
    fn test_identical_descriptors_score_exactly_one() {
        let settings = SignatureSettings::default();
        let a = SignatureDescriptor::compute(&gradient(64, 48), &settings);
        let b = a.clone();

        assert_eq!(signature_similarity(&a.blocks, &b.blocks), 1.0);
        assert_eq!(color_similarity(&a.color, &b.color), 1.0);
        assert_eq!(edge_similarity(&a.edges, &b.edges), 1.0);
        assert_eq!(SignatureMatcher::new(settings).similarity(&a, &b), 1.0);
    }

    #[test]
    fn test_descriptor_shape() {
        let settings = SignatureSettings::default();
        let d = SignatureDescriptor::compute(&checker(100, 100), &settings);
        assert_eq!(d.blocks.len(), 64);
        assert!(d.edges.maximum >= d.edges.average);
        assert!(d.edges.maximum <= EDGE_RANGE);
    }

    #[test]
    fn test_mismatched_lengths_compare_as_zero() {
        assert_eq!(signature_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(signature_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_similarities_stay_in_unit_range() {
        let settings = SignatureSettings::default();
        let black = SignatureDescriptor::compute(&RgbaImage::from_pixel(32, 32, Rgba([0, 0, 0, 255])), &settings);
        let white = SignatureDescriptor::compute(&RgbaImage::from_pixel(32, 32, Rgba([255, 255, 255, 255])), &settings);
        let busy = SignatureDescriptor::compute(&checker(32, 32), &settings);

        for (a, b) in [(&black, &white), (&black, &busy), (&white, &busy)] {
            for score in [
                signature_similarity(&a.blocks, &b.blocks),
                color_similarity(&a.color, &b.color),
                edge_similarity(&a.edges, &b.edges),
                SignatureMatcher::new(settings.clone()).similarity(a, b),
            ] {
                assert!((0.0..=1.0).contains(&score), "score {} out of range", score);
            }
        }
        assert_eq!(signature_similarity(&black.blocks, &white.blocks), 0.0);
    }

    #[test]
    fn test_detect_picks_matching_product() {
        let store = store_with(&[
            ("gradient-can", 0.7, vec![gradient(80, 80)]),
            ("checker-box", 0.7, vec![checker(80, 80)]),
        ]);
        let matcher = SignatureMatcher::new(SignatureSettings::default());

        let frame = Frame::from_image(gradient(160, 160));
        let candidate = matcher.detect(&frame, &store).unwrap().unwrap();
        assert_eq!(candidate.product_id, "gradient-can");
        assert_eq!(candidate.method, MatchMethod::Signature);
        assert!(candidate.confidence > 0.9);
    }

    #[test]
    fn test_detect_respects_product_threshold() {
        let store = store_with(&[("checker-box", 1.0, vec![checker(80, 80)])]);
        let matcher = SignatureMatcher::new(SignatureSettings::default());

        // A perfect match cannot exceed a threshold of 1.0
        let frame = Frame::from_image(checker(80, 80));
        assert!(matcher.detect(&frame, &store).unwrap().is_none());
    }

    #[test]
    fn test_detect_does_not_fall_back_to_runner_up() {
        let store = store_with(&[
            ("checker-box", 1.0, vec![checker(80, 80)]),
            ("gradient-can", 0.0, vec![gradient(80, 80)]),
        ]);
        let matcher = SignatureMatcher::new(SignatureSettings::default());

        // The best-scoring product misses its threshold, so nothing matches
        let frame = Frame::from_image(checker(80, 80));
        assert!(matcher.detect(&frame, &store).unwrap().is_none());

        let store = store_with(&[
            ("checker-box", 0.5, vec![checker(80, 80)]),
            ("gradient-can", 0.0, vec![gradient(80, 80)]),
        ]);
        let candidate = matcher.detect(&frame, &store).unwrap().unwrap();
        assert_eq!(candidate.product_id, "checker-box");
    }

    #[test]
    fn test_detect_rejects_malformed_frame() {
        let store = store_with(&[("checker-box", 0.5, vec![checker(80, 80)])]);
        let matcher = SignatureMatcher::new(SignatureSettings::default());
        assert!(matcher.detect(&Frame::new(vec![1, 2, 3], 4, 4), &store).is_err());
    }
}
