//! Reference image variations
//!
//! Lighting, focus, color, rotation, and scale variants of a reference view.
//! Each variant carries a reduced weight because it is a guess at how the
//! product might look, not a real photo. Every variant keeps the size of the
//! source image.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};

/// Number of variants produced per reference
pub const VARIANT_COUNT: usize = 18;

const ROTATIONS: [(&str, f32); 6] = [
    ("rot_neg15", -15.0),
    ("rot_neg10", -10.0),
    ("rot_neg05", -5.0),
    ("rot_pos05", 5.0),
    ("rot_pos10", 10.0),
    ("rot_pos15", 15.0),
];

const SCALES: [(&str, f32); 4] = [("scale80", 0.8), ("scale90", 0.9), ("scale110", 1.1), ("scale120", 1.2)];

/// 3x3 sharpening kernel, normalized by its sum
const SHARPEN: [f32; 9] = [-2.0, -2.0, -2.0, -2.0, 32.0, -2.0, -2.0, -2.0, -2.0];

const BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// A derived reference image
pub struct Variant {
    /// Appended to the reference id
    pub suffix: &'static str,
    /// Multiplied into the reference weight
    pub weight: f32,
    pub image: RgbaImage,
}

/// Derive every variant of one reference image
pub fn variants(image: &RgbaImage) -> Vec<Variant> {
    let mut out = vec![
        Variant { suffix: "bright", weight: 0.8, image: brightness(image, 1.3) },
        Variant { suffix: "dim", weight: 0.8, image: brightness(image, 0.7) },
        Variant { suffix: "contrast", weight: 0.8, image: contrast(image, 1.2) },
        Variant { suffix: "low_contrast", weight: 0.7, image: contrast(image, 0.8) },
    ];

    for (suffix, degrees) in ROTATIONS {
        out.push(Variant {
            suffix,
            weight: 0.7,
            image: rotate_about_center(image, degrees.to_radians(), Interpolation::Bilinear, BACKGROUND),
        });
    }

    for (suffix, factor) in SCALES {
        out.push(Variant { suffix, weight: 0.8, image: rescale(image, factor) });
    }

    out.extend([
        Variant { suffix: "blur", weight: 0.7, image: gaussian_blur_f32(image, 0.5) },
        Variant { suffix: "sharp", weight: 0.8, image: imageops::filter3x3(image, &SHARPEN) },
        Variant { suffix: "desat", weight: 0.7, image: saturation(image, 0.8) },
        Variant { suffix: "sat", weight: 0.8, image: saturation(image, 1.2) },
    ]);
    out
}

fn luma(p: &Rgba<u8>) -> f32 {
    (299.0 * p[0] as f32 + 587.0 * p[1] as f32 + 114.0 * p[2] as f32) / 1000.0
}

/// Blend every color channel with `degenerate(pixel, channel)` by `factor`
fn blend(image: &RgbaImage, factor: f32, degenerate: impl Fn(&Rgba<u8>, usize) -> f32) -> RgbaImage {
    let mut out = image.clone();
    for p in out.pixels_mut() {
        let source = *p;
        for c in 0..3 {
            let base = degenerate(&source, c);
            p[c] = (base + factor * (source[c] as f32 - base)).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Scale color channels by `factor`
pub fn brightness(image: &RgbaImage, factor: f32) -> RgbaImage {
    blend(image, factor, |_, _| 0.0)
}

/// Stretch color channels around the mean gray level
pub fn contrast(image: &RgbaImage, factor: f32) -> RgbaImage {
    let count = (image.width() as usize * image.height() as usize).max(1);
    let mean = (image.pixels().map(luma).sum::<f32>() / count as f32).round();
    blend(image, factor, |_, _| mean)
}

/// Push color channels away from (or toward) the pixel's gray level
pub fn saturation(image: &RgbaImage, factor: f32) -> RgbaImage {
    blend(image, factor, |p, _| luma(p))
}

/// Resize about the center, padding with white or cropping back to size
pub fn rescale(image: &RgbaImage, factor: f32) -> RgbaImage {
    let (w, h) = image.dimensions();
    let nw = ((w as f32 * factor) as u32).max(1);
    let nh = ((h as f32 * factor) as u32).max(1);
    let scaled = imageops::resize(image, nw, nh, FilterType::Lanczos3);

    if nw <= w && nh <= h {
        let mut canvas = RgbaImage::from_pixel(w, h, BACKGROUND);
        imageops::overlay(&mut canvas, &scaled, ((w - nw) / 2) as i64, ((h - nh) / 2) as i64);
        canvas
    } else {
        let x = nw.saturating_sub(w) / 2;
        let y = nh.saturating_sub(h) / 2;
        imageops::crop_imm(&scaled, x, y, w.min(nw), h.min(nh)).to_image()
    }
}
