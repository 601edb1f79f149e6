//! Template scanning
//!
//! Raster-correlation fallback for the keypoint matcher. A reference is slid
//! across the frame and scored with zero-mean normalized cross-correlation.
//! References larger than the frame are rejected rather than scanned.

use image::GrayImage;

/// Best correlation found by a scan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanMatch {
    /// Top-left corner of the best window
    pub position: (u32, u32),
    /// Correlation in [0, 1]
    pub score: f32,
}

/// Slide `template` over `image`, coarse then fine.
///
/// The coarse pass visits every `stride`-th position; the fine pass revisits
/// the neighbourhood of the coarse winner at single-pixel steps. Returns
/// `None` when the template does not fit inside the image.
pub fn scan(image: &GrayImage, template: &GrayImage, stride: u32) -> Option<ScanMatch> {
    let (img_w, img_h) = image.dimensions();
    let (tmpl_w, tmpl_h) = template.dimensions();

    if tmpl_w == 0 || tmpl_h == 0 || tmpl_w > img_w || tmpl_h > img_h {
        return None;
    }

    let max_x = img_w - tmpl_w;
    let max_y = img_h - tmpl_h;
    let stride = stride.max(1);

    let mut best = ScanMatch { position: (0, 0), score: -1.0 };
    let visit = |x: u32, y: u32, best: &mut ScanMatch| {
        let score = normalized_cross_correlation(image, template, x, y);
        if score > best.score {
            *best = ScanMatch { position: (x, y), score };
        }
    };

    for y in (0..=max_y).step_by(stride as usize) {
        for x in (0..=max_x).step_by(stride as usize) {
            visit(x, y, &mut best);
        }
    }

    if stride > 1 {
        let (cx, cy) = best.position;
        let x_range = cx.saturating_sub(stride - 1)..=(cx + stride - 1).min(max_x);
        let y_range = cy.saturating_sub(stride - 1)..=(cy + stride - 1).min(max_y);
        for y in y_range {
            for x in x_range.clone() {
                visit(x, y, &mut best);
            }
        }
    }

    best.score = best.score.max(0.0);
    Some(best)
}

/// Normalized cross-correlation between an image window and a template
pub fn normalized_cross_correlation(image: &GrayImage, template: &GrayImage, x: u32, y: u32) -> f32 {
    let (tmpl_w, tmpl_h) = template.dimensions();

    let mut sum_it = 0.0f64;
    let mut sum_i2 = 0.0f64;
    let mut sum_t2 = 0.0f64;
    let mut sum_i = 0.0f64;
    let mut sum_t = 0.0f64;

    for ty in 0..tmpl_h {
        for tx in 0..tmpl_w {
            let img_val = image.get_pixel(x + tx, y + ty).0[0] as f64;
            let tmpl_val = template.get_pixel(tx, ty).0[0] as f64;

            sum_it += img_val * tmpl_val;
            sum_i2 += img_val * img_val;
            sum_t2 += tmpl_val * tmpl_val;
            sum_i += img_val;
            sum_t += tmpl_val;
        }
    }

    let count = (tmpl_w * tmpl_h) as f64;
    if count == 0.0 {
        return 0.0;
    }

    // Zero-mean normalized cross-correlation
    let mean_i = sum_i / count;
    let mean_t = sum_t / count;

    let numerator = sum_it - count * mean_i * mean_t;
    let denom_i = (sum_i2 - count * mean_i * mean_i).max(0.0).sqrt();
    let denom_t = (sum_t2 - count * mean_t * mean_t).max(0.0).sqrt();

    let denominator = denom_i * denom_t;

    if denominator < 1e-10 {
        return 0.0;
    }

    (numerator / denominator).clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn pattern(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| Luma([((x * 37 + y * 91 + x * y) % 251) as u8]))
    }

    #[test]
    fn test_ncc_perfect_match() {
        let img = GrayImage::from_raw(4, 2, vec![100u8, 200, 100, 200, 200, 100, 200, 100]).unwrap();
        let tmpl = GrayImage::from_raw(2, 1, vec![100u8, 200]).unwrap();

        let score = normalized_cross_correlation(&img, &tmpl, 0, 0);
        assert!(score > 0.99, "Perfect match should have high score: {}", score);
    }

    #[test]
    fn test_ncc_flat_template_scores_zero() {
        let img = pattern(8, 8);
        let flat = GrayImage::from_pixel(3, 3, Luma([50]));
        assert_eq!(normalized_cross_correlation(&img, &flat, 1, 1), 0.0);
    }

    #[test]
    fn test_scan_finds_embedded_template() {
        let image = pattern(60, 40);
        let template = image::imageops::crop_imm(&image, 23, 11, 16, 12).to_image();

        let found = scan(&image, &template, 1).unwrap();
        assert_eq!(found.position, (23, 11));
        assert!(found.score > 0.99);
    }

    #[test]
    fn test_coarse_scan_refines_to_exact_position() {
        let image = GrayImage::from_fn(60, 40, |x, y| {
            let dx = x as f32 - 30.0;
            let dy = y as f32 - 20.0;
            let blob = 180.0 * (-(dx * dx + dy * dy) / 50.0).exp();
            Luma([(x as f32 + blob).min(255.0) as u8])
        });
        let template = image::imageops::crop_imm(&image, 23, 11, 16, 12).to_image();

        let found = scan(&image, &template, 4).unwrap();
        assert_eq!(found.position, (23, 11));
    }

    #[test]
    fn test_scan_rejects_oversized_template() {
        let image = pattern(20, 20);
        assert!(scan(&image, &pattern(21, 10), 1).is_none());
        assert!(scan(&image, &pattern(10, 21), 1).is_none());
        assert!(scan(&image, &GrayImage::new(0, 0), 1).is_none());
    }
}
