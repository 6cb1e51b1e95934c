//! Uniform cosmetic passes over the merged canvas.
//!
//! Order is fixed: anti-block blur, median denoise, unsharp sharpening,
//! saturation/contrast trim. Every numeric knob is clamped; nothing here
//! rejects input.

use image::{imageops, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

const ANTI_BLOCK_SIGMA: f32 = 0.3;
const MAX_SHARPEN_GAIN: f32 = 0.8;
/// Fraction of the requested contrast change that is actually applied.
const CONTRAST_TRIM: f32 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessOptions {
    /// Light blur that hides residual block edges from the merge.
    pub anti_block: bool,
    pub sharpen: bool,
    /// 0..=1
    pub sharpen_amount: f32,
    pub denoise: bool,
    /// 0..=100
    pub denoise_amount: f32,
    pub enhance_contrast: bool,
    /// 0..=2, 1 is neutral.
    pub contrast_amount: f32,
}

impl Default for PostProcessOptions {
    fn default() -> Self {
        Self {
            anti_block: true,
            sharpen: false,
            sharpen_amount: 0.5,
            denoise: false,
            denoise_amount: 0.0,
            enhance_contrast: false,
            contrast_amount: 1.0,
        }
    }
}

impl PostProcessOptions {
    /// Map the request's 0-100 quality knobs onto post-processing options.
    /// A contrast of 50 is neutral.
    pub fn from_quality(sharpness: f32, denoise: f32, contrast: f32) -> Self {
        let sharpness = clamp_finite(sharpness, 0.0, 100.0, 0.0);
        let denoise = clamp_finite(denoise, 0.0, 100.0, 0.0);
        let contrast = clamp_finite(contrast, 0.0, 100.0, 50.0);

        Self {
            anti_block: true,
            sharpen: sharpness > 0.0,
            sharpen_amount: sharpness / 100.0,
            denoise: denoise > 0.0,
            denoise_amount: denoise,
            enhance_contrast: (contrast - 50.0).abs() > f32::EPSILON,
            contrast_amount: contrast / 50.0,
        }
    }

    fn clamped(&self) -> Self {
        Self {
            anti_block: self.anti_block,
            sharpen: self.sharpen,
            sharpen_amount: clamp_finite(self.sharpen_amount, 0.0, 1.0, 0.5),
            denoise: self.denoise,
            denoise_amount: clamp_finite(self.denoise_amount, 0.0, 100.0, 0.0),
            enhance_contrast: self.enhance_contrast,
            contrast_amount: clamp_finite(self.contrast_amount, 0.0, 2.0, 1.0),
        }
    }
}

fn clamp_finite(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

pub fn post_process(image: &RgbaImage, options: &PostProcessOptions) -> RgbaImage {
    let options = options.clamped();
    let mut current = image.clone();

    if options.anti_block {
        current = imageops::blur(&current, ANTI_BLOCK_SIGMA);
    }

    if options.denoise && options.denoise_amount > 0.0 {
        let radius = if options.denoise_amount <= 50.0 { 1 } else { 2 };
        current = imageproc::filter::median_filter(&current, radius, radius);
    }

    if options.sharpen && options.sharpen_amount > 0.0 {
        let sigma = 1.0 + options.sharpen_amount;
        current = unsharp_mask(&current, sigma, options.sharpen_amount * MAX_SHARPEN_GAIN);
    }

    if options.enhance_contrast {
        adjust_saturation_contrast(&mut current, options.contrast_amount);
    }

    debug!(?options, "Post-processing complete");
    current
}

/// `out = src + gain × (src − blur(src))` on the colour channels; alpha is kept.
pub fn unsharp_mask(image: &RgbaImage, sigma: f32, gain: f32) -> RgbaImage {
    if sigma <= 0.0 || gain <= 0.0 {
        return image.clone();
    }

    let blurred = imageops::blur(image, sigma);
    let mut output = image.clone();
    for (out, soft) in output.pixels_mut().zip(blurred.pixels()) {
        for c in 0..3 {
            let value = out.0[c] as f32;
            let detail = value - soft.0[c] as f32;
            out.0[c] = (value + gain * detail).round().clamp(0.0, 255.0) as u8;
        }
    }
    output
}

/// Mild saturation and linear contrast trim around mid-grey.
fn adjust_saturation_contrast(image: &mut RgbaImage, contrast_amount: f32) {
    let factor = 1.0 + (contrast_amount - 1.0) * CONTRAST_TRIM;
    if (factor - 1.0).abs() <= f32::EPSILON {
        return;
    }

    for pixel in image.pixels_mut() {
        let Rgba([r, g, b, a]) = *pixel;
        let (r, g, b) = (r as f32, g as f32, b as f32);
        let luma = 0.299 * r + 0.587 * g + 0.114 * b;

        let mut channels = [r, g, b];
        for value in &mut channels {
            let saturated = luma + (*value - luma) * factor;
            *value = ((saturated - 128.0) * factor + 128.0).round().clamp(0.0, 255.0);
        }

        *pixel = Rgba([
            channels[0] as u8,
            channels[1] as u8,
            channels[2] as u8,
            a,
        ]);
    }
}
