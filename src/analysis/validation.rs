//! Accuracy validation over a labelled image set
//!
//! Layout: `<root>/<product_id>/*.png`, with a `none` directory holding frames
//! that should match nothing. Each image runs through one detection cycle
//! without stability tracking.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::capture::{list_images, Frame};
use crate::engine::DetectionOrchestrator;
use crate::vision::decode_image;

/// Directory name for negative samples
pub const NEGATIVE_LABEL: &str = "none";

/// Prediction for one labelled image
#[derive(Debug, Clone, Serialize)]
pub struct SamplePrediction {
    pub path: PathBuf,
    pub expected: Option<String>,
    pub predicted: Option<String>,
    pub confidence: f32,
    pub method: String,
    pub correct: bool,
}

/// Summary statistics of a set of confidences
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfidenceStats {
    pub count: usize,
    pub mean: f32,
    pub std: f32,
    pub min: f32,
    pub max: f32,
}

impl ConfidenceStats {
    pub fn from_values(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        Self {
            count: values.len(),
            mean,
            std: variance.sqrt(),
            min: values.iter().copied().fold(f32::INFINITY, f32::min),
            max: values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        }
    }
}

/// Precision/recall of one label
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassStats {
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    /// Samples whose expected label is this class
    pub support: usize,
}

impl ClassStats {
    fn new(true_positives: usize, false_positives: usize, false_negatives: usize) -> Self {
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f32 / den as f32 };
        let precision = ratio(true_positives, true_positives + false_positives);
        let recall = ratio(true_positives, true_positives + false_negatives);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            f1,
            true_positives,
            false_positives,
            false_negatives,
            support: true_positives + false_negatives,
        }
    }
}

/// Expected (rows) against predicted (columns) counts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfusionMatrix {
    /// Row and column labels, sorted, with `none` for "no product"
    pub labels: Vec<String>,
    pub counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Count for one expected/predicted label pair
    pub fn get(&self, expected: &str, predicted: &str) -> usize {
        let index = |label: &str| self.labels.iter().position(|l| l == label);
        match (index(expected), index(predicted)) {
            (Some(row), Some(col)) => self.counts[row][col],
            _ => 0,
        }
    }
}

/// Outcome of a validation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub total: usize,
    pub correct: usize,
    /// Fraction of samples predicted correctly, 0 when there are none
    pub accuracy: f32,
    pub confidence: ConfidenceStats,
    pub correct_confidence: ConfidenceStats,
    pub incorrect_confidence: ConfidenceStats,
    pub per_class: BTreeMap<String, ClassStats>,
    pub confusion_matrix: ConfusionMatrix,
    pub samples: Vec<SamplePrediction>,
}

fn label_of(product: &Option<String>) -> &str {
    product.as_deref().unwrap_or(NEGATIVE_LABEL)
}

impl ValidationReport {
    /// Build the report; `products` adds classes that may have no samples
    fn from_samples<'a>(samples: Vec<SamplePrediction>, products: impl IntoIterator<Item = &'a str>) -> Self {
        let (right, wrong): (Vec<&SamplePrediction>, Vec<&SamplePrediction>) =
            samples.iter().partition(|s| s.correct);
        let confidences = |set: &[&SamplePrediction]| set.iter().map(|s| s.confidence).collect::<Vec<_>>();

        let mut labels: BTreeSet<&str> = products.into_iter().collect();
        labels.insert(NEGATIVE_LABEL);
        for sample in &samples {
            labels.insert(label_of(&sample.expected));
            labels.insert(label_of(&sample.predicted));
        }
        let labels: Vec<String> = labels.into_iter().map(str::to_string).collect();

        let mut counts = vec![vec![0usize; labels.len()]; labels.len()];
        for sample in &samples {
            let row = labels.iter().position(|l| l == label_of(&sample.expected));
            let col = labels.iter().position(|l| l == label_of(&sample.predicted));
            if let (Some(row), Some(col)) = (row, col) {
                counts[row][col] += 1;
            }
        }

        let per_class = labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let tp = counts[i][i];
                let fn_ = counts[i].iter().sum::<usize>() - tp;
                let fp = counts.iter().map(|row| row[i]).sum::<usize>() - tp;
                (label.clone(), ClassStats::new(tp, fp, fn_))
            })
            .collect();

        let total = samples.len();
        let correct = right.len();
        let all: Vec<&SamplePrediction> = samples.iter().collect();
        Self {
            total,
            correct,
            accuracy: if total == 0 { 0.0 } else { correct as f32 / total as f32 },
            confidence: ConfidenceStats::from_values(&confidences(&all)),
            correct_confidence: ConfidenceStats::from_values(&confidences(&right)),
            incorrect_confidence: ConfidenceStats::from_values(&confidences(&wrong)),
            per_class,
            confusion_matrix: ConfusionMatrix { labels, counts },
            samples,
        }
    }
}

/// Run every labelled image under `root` through `orchestrator`
pub async fn validate_dataset(orchestrator: &DetectionOrchestrator, root: &Path) -> Result<ValidationReport> {
    let mut labels: Vec<PathBuf> = std::fs::read_dir(root)
        .with_context(|| format!("Failed to read validation directory: {:?}", root))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    labels.sort();

    let mut samples = Vec::new();
    for dir in labels {
        let label = dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let expected = (label != NEGATIVE_LABEL).then(|| label.clone());
        if let Some(id) = &expected {
            if !orchestrator.store().read().contains(id) {
                warn!("Validation label '{}' is not a registered product", id);
            }
        }

        for path in list_images(&dir)? {
            let image = match decode_image(&path) {
                Ok(image) => image,
                Err(e) => {
                    warn!("Skipping validation image: {:#}", e);
                    continue;
                }
            };

            let decision = orchestrator.detect(Arc::new(Frame::from_image(image))).await;
            let correct = decision.product_id == expected;
            samples.push(SamplePrediction {
                path,
                expected: expected.clone(),
                predicted: decision.product_id,
                confidence: decision.confidence,
                method: decision.method.to_string(),
                correct,
            });
        }
    }

    let store = orchestrator.store();
    let report = {
        let store = store.read();
        ValidationReport::from_samples(samples, store.products().map(|p| p.product_id.as_str()))
    };
    info!(
        "Validation: {}/{} correct ({:.1}%)",
        report.correct,
        report.total,
        report.accuracy * 100.0
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{orchestrator, silent, texture};
    use crate::vision::DetectionMethod;
    use image::{Rgba, RgbaImage};
    use tempfile::tempdir;

    #[test]
    fn test_confidence_stats() {
        let stats = ConfidenceStats::from_values(&[0.2, 0.4, 0.6]);
        assert_eq!(stats.count, 3);
        assert!((stats.mean - 0.4).abs() < 1e-6);
        assert!((stats.std - (0.08f32 / 3.0).sqrt()).abs() < 1e-6);
        assert_eq!(stats.min, 0.2);
        assert_eq!(stats.max, 0.6);

        assert_eq!(ConfidenceStats::from_values(&[]), ConfidenceStats::default());
    }

    #[test]
    fn test_class_stats_without_predictions() {
        let stats = ClassStats::new(0, 0, 3);
        assert_eq!(stats.precision, 0.0);
        assert_eq!(stats.recall, 0.0);
        assert_eq!(stats.f1, 0.0);
        assert_eq!(stats.support, 3);
    }

    #[tokio::test]
    async fn test_validate_dataset() {
        let dir = tempdir().unwrap();
        for (label, images) in [
            ("alpha", vec![texture(160, 120, 7)]),
            ("beta", vec![texture(160, 120, 11), texture(160, 120, 7)]),
            ("none", vec![RgbaImage::from_pixel(160, 120, Rgba([128, 128, 128, 255]))]),
        ] {
            let label_dir = dir.path().join(label);
            std::fs::create_dir(&label_dir).unwrap();
            for (i, image) in images.iter().enumerate() {
                image.save(label_dir.join(format!("{}.png", i))).unwrap();
            }
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let orchestrator = orchestrator(DetectionMethod::Keypoint, silent());
        let report = validate_dataset(&orchestrator, dir.path()).await.unwrap();

        assert_eq!(report.total, 4);
        assert_eq!(report.correct, 3);
        assert!((report.accuracy - 0.75).abs() < 1e-6);
        assert_eq!(report.correct_confidence.count, 3);
        assert_eq!(report.incorrect_confidence.count, 1);

        let wrong = report.samples.iter().find(|s| !s.correct).unwrap();
        assert_eq!(wrong.expected.as_deref(), Some("beta"));
        assert_eq!(wrong.predicted.as_deref(), Some("alpha"));

        let matrix = &report.confusion_matrix;
        assert_eq!(matrix.labels, vec!["alpha", "beta", "none"]);
        assert_eq!(matrix.counts, vec![vec![1, 0, 0], vec![1, 1, 0], vec![0, 0, 1]]);
        assert_eq!(matrix.get("beta", "alpha"), 1);
        assert_eq!(matrix.get("none", "none"), 1);

        let alpha = &report.per_class["alpha"];
        assert_eq!((alpha.true_positives, alpha.false_positives, alpha.support), (1, 1, 1));
        assert!((alpha.precision - 0.5).abs() < 1e-6);
        assert!((alpha.recall - 1.0).abs() < 1e-6);
        assert!((alpha.f1 - 2.0 / 3.0).abs() < 1e-6);

        let beta = &report.per_class["beta"];
        assert_eq!((beta.false_negatives, beta.support), (1, 2));
        assert!((beta.precision - 1.0).abs() < 1e-6);
        assert!((beta.recall - 0.5).abs() < 1e-6);

        assert_eq!(report.per_class["none"].f1, 1.0);
        assert_eq!(report.confidence.count, 4);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["total"], 4);
        assert_eq!(json["per_class"]["beta"]["support"], 2);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let orchestrator = orchestrator(DetectionMethod::Keypoint, silent());
        assert!(validate_dataset(&orchestrator, Path::new("/nonexistent/validation")).await.is_err());
    }
}
