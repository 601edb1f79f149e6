//! Text matching
//!
//! Recognized packaging text is lower-cased and compared against each
//! product's keyword list with a fuzzy edit-distance similarity.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::capture::Frame;
use crate::config::TextSettings;
use crate::vision::ocr::{recognize_with_timeout, TextRecognizer};
use crate::vision::references::{ProductEntry, ReferenceStore};
use crate::vision::{clamp_unit, CandidateDetails, MatchCandidate, MatchMethod};

/// Similarity of two strings in [0, 1]; symmetric.
///
/// When the longer string contains the shorter one the result is
/// `containment` without computing an edit distance.
pub fn similarity(a: &str, b: &str, containment: f32) -> f32 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let (len_a, len_b) = (a.chars().count(), b.chars().count());
    let (longer, shorter) = if len_a >= len_b { (a, b) } else { (b, a) };
    if longer.contains(shorter) {
        return clamp_unit(containment);
    }

    let max_len = len_a.max(len_b);
    let distance = strsim::levenshtein(a, b).min(max_len);
    (max_len - distance) as f32 / max_len as f32
}

/// Best score of one keyword against recognized text, if accepted.
///
/// `text` must already be lower-cased. Multi-word keywords are compared
/// against runs of the same number of words.
pub fn keyword_score(keyword: &str, text: &str, words: &[&str], settings: &TextSettings) -> Option<f32> {
    if keyword.is_empty() {
        return None;
    }
    if text.contains(keyword) {
        return Some(1.0);
    }

    let span = keyword.split_whitespace().count().max(1);
    let best = words
        .windows(span.min(words.len().max(1)))
        .map(|run| similarity(keyword, &run.join(" "), settings.containment_similarity))
        .fold(0.0f32, f32::max);

    (best >= settings.min_similarity).then_some(best)
}

/// Text matcher
pub struct TextMatcher {
    settings: TextSettings,
    recognizer: Arc<dyn TextRecognizer>,
}

impl TextMatcher {
    pub fn new(settings: TextSettings, recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self { settings, recognizer }
    }

    /// Run the recognizer under the configured timeout
    pub async fn recognize(&self, frame: &Frame) -> Option<String> {
        let timeout = Duration::from_millis(self.settings.timeout_ms);
        recognize_with_timeout(self.recognizer.as_ref(), frame, timeout).await
    }

    /// Best-scoring product for already-recognized text, if it clears its threshold
    pub fn match_text(&self, text: &str, store: &ReferenceStore) -> Option<MatchCandidate> {
        let text = text.trim().to_lowercase();
        if text.is_empty() {
            return None;
        }
        let words: Vec<&str> = text.split_whitespace().collect();

        let mut best: Option<(f32, MatchCandidate)> = None;
        for product in store.products() {
            let Some((confidence, matched)) = self.score_product(product, &text, &words) else {
                continue;
            };
            debug!(
                "Text score for '{}': {:.3} ({}/{} keywords)",
                product.product_id,
                confidence,
                matched.len(),
                product.keywords.len()
            );

            if best.as_ref().map_or(true, |(_, b)| confidence > b.confidence) {
                let candidate = MatchCandidate::new(
                    product.product_id.clone(),
                    confidence,
                    MatchMethod::Text,
                    CandidateDetails::Text {
                        matched_keywords: matched,
                        recognized_text: text.clone(),
                    },
                );
                best = Some((product.confidence_threshold, candidate));
            }
        }
        best.and_then(|(threshold, candidate)| (candidate.confidence > threshold).then_some(candidate))
    }

    fn score_product(&self, product: &ProductEntry, text: &str, words: &[&str]) -> Option<(f32, Vec<String>)> {
        if product.keywords.is_empty() {
            return None;
        }

        let mut matched = Vec::new();
        let mut total = 0.0;
        for keyword in &product.keywords {
            if let Some(score) = keyword_score(keyword, text, words, &self.settings) {
                total += score;
                matched.push(keyword.clone());
            }
        }
        if matched.is_empty() {
            return None;
        }

        let average = total / matched.len() as f32;
        let coverage = matched.len() as f32 / product.keywords.len() as f32;
        let length = (text.chars().count() as f32 / self.settings.length_norm.max(1) as f32).min(1.0);

        let confidence = clamp_unit(
            self.settings.score_weight * average
                + self.settings.coverage_weight * coverage
                + self.settings.length_weight * length,
        );
        Some((confidence, matched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::vision::ocr::NoTextRecognizer;
    use crate::vision::references::test_support::registration;
    use image::{Rgba, RgbaImage};

    fn settings() -> TextSettings {
        TextSettings::default()
    }

    fn store(products: &[(&str, f32, &[&str])]) -> ReferenceStore {
        let mut store = ReferenceStore::new(&AppConfig::default());
        for (id, threshold, keywords) in products {
            let image = RgbaImage::from_pixel(8, 8, Rgba([200, 200, 200, 255]));
            store.register(registration(id, *threshold, vec![image], keywords)).unwrap();
        }
        store
    }

    fn matcher() -> TextMatcher {
        TextMatcher::new(settings(), Arc::new(NoTextRecognizer))
    }

    #[test]
    fn test_similarity_edit_distance() {
        let sim = similarity("spearmint", "spearmnt", 0.8);
        assert!((sim - 8.0 / 9.0).abs() < 1e-6, "got {}", sim);
        assert_eq!(similarity("mint", "mint", 0.8), 1.0);
        assert_eq!(similarity("", "", 0.8), 1.0);
        assert_eq!(similarity("mint", "", 0.8), 0.0);
    }

    #[test]
    fn test_similarity_containment_shortcut() {
        assert_eq!(similarity("zyn", "xzynx", 0.8), 0.8);
        assert_eq!(similarity("xzynx", "zyn", 0.8), 0.8);
    }

    #[test]
    fn test_similarity_is_symmetric() {
        let words = ["zyn", "apple", "mint", "spearmint", "spearmnt", "nicotine", "pouches", "citrus", ""];
        for a in words {
            for b in words {
                assert_eq!(similarity(a, b, 0.8), similarity(b, a, 0.8), "{:?} vs {:?}", a, b);
                let s = similarity(a, b, 0.8);
                assert!((0.0..=1.0).contains(&s));
            }
        }
    }

    #[test]
    fn test_keyword_substring_scores_one() {
        let text = "xzynx";
        let words: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(keyword_score("zyn", text, &words, &settings()), Some(1.0));
    }

    #[test]
    fn test_keyword_fuzzy_acceptance() {
        let text = "cool spearmnt flavour";
        let words: Vec<&str> = text.split_whitespace().collect();
        let score = keyword_score("spearmint", text, &words, &settings()).unwrap();
        assert!((score - 8.0 / 9.0).abs() < 1e-6);

        assert_eq!(keyword_score("wintergreen", text, &words, &settings()), None);
    }

    #[test]
    fn test_multi_word_keyword_matches_word_runs() {
        let text = "zyn aple mint 6mg";
        let words: Vec<&str> = text.split_whitespace().collect();
        let score = keyword_score("apple mint", text, &words, &settings()).unwrap();
        assert!((score - 0.9).abs() < 1e-6, "got {}", score);
    }

    #[test]
    fn test_match_text_picks_best_product() {
        let store = store(&[
            ("zyn-apple-mint", 0.5, &["zyn", "apple mint"]),
            ("zyn-spearmint", 0.5, &["zyn", "spearmint"]),
        ]);

        let candidate = matcher().match_text("ZYN Spearmint nicotine pouches", &store).unwrap();
        assert_eq!(candidate.product_id, "zyn-spearmint");
        assert_eq!(candidate.method, MatchMethod::Text);
        match candidate.details {
            CandidateDetails::Text { matched_keywords, recognized_text } => {
                assert_eq!(matched_keywords, vec!["zyn", "spearmint"]);
                assert_eq!(recognized_text, "zyn spearmint nicotine pouches");
            }
            other => panic!("unexpected details {:?}", other),
        }
        // 0.7 * 1.0 + 0.2 * 1.0 + 0.1 * (30 / 50)
        assert!((candidate.confidence - 0.96).abs() < 1e-5);
    }

    #[test]
    fn test_match_text_respects_threshold() {
        let store = store(&[("zyn-apple-mint", 0.95, &["zyn", "apple mint"])]);
        // 0.7 + 0.2 * 0.5 + 0.1 * (3 / 50) = 0.806
        assert!(matcher().match_text("zyn", &store).is_none());

        let store = self::store(&[("zyn-apple-mint", 0.8, &["zyn", "apple mint"])]);
        assert!(matcher().match_text("zyn", &store).is_some());
    }

    #[test]
    fn test_match_text_does_not_fall_back_to_runner_up() {
        // 0.7 + 0.2 + 0.1 * (13 / 50) = 0.926 against 0.7 + 0.1 + 0.026 = 0.826
        let store = store(&[
            ("zyn-spearmint", 0.95, &["zyn", "spearmint"]),
            ("zyn-wintergreen", 0.0, &["zyn", "wintergreen"]),
        ]);
        assert!(matcher().match_text("zyn spearmint", &store).is_none());

        let store = self::store(&[
            ("zyn-spearmint", 0.9, &["zyn", "spearmint"]),
            ("zyn-wintergreen", 0.0, &["zyn", "wintergreen"]),
        ]);
        let candidate = matcher().match_text("zyn spearmint", &store).unwrap();
        assert_eq!(candidate.product_id, "zyn-spearmint");
    }

    #[test]
    fn test_no_text_or_no_keywords_yields_nothing() {
        let store = store(&[("plain", 0.1, &[]), ("zyn", 0.1, &["zyn"])]);
        assert!(matcher().match_text("   ", &store).is_none());
        assert!(matcher().match_text("completely unrelated", &store).is_none());
    }

    #[tokio::test]
    async fn test_recognize_without_engine_is_empty() {
        let frame = Frame::from_image(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255])));
        assert_eq!(matcher().recognize(&frame).await.as_deref(), Some(""));
    }
}
