use image::{imageops, RgbaImage};
use tracing::trace;

use super::{EnhanceParams, TileEnhancer};
use crate::error::EnhanceError;
use crate::postprocess::unsharp_mask;
use crate::types::{scale_dimension, TileContext};

pub const DEFAULT_SHARPEN_STRENGTH: f32 = 0.6;

const GENTLE_TEXTURES: [&str; 4] = ["skin", "face", "portrait", "complexion"];
const DETAILED_TEXTURES: [&str; 6] = ["hair", "fur", "fabric", "foliage", "grass", "feather"];

/// Filter-only enhancer: Lanczos3 resampling followed by context-aware
/// unsharp masking.
#[derive(Debug, Clone)]
pub struct LocalEnhancer {
    sharpen_strength: f32,
}

impl LocalEnhancer {
    pub fn new(sharpen_strength: f32) -> Self {
        Self {
            sharpen_strength: if sharpen_strength.is_finite() {
                sharpen_strength.clamp(0.0, 2.0)
            } else {
                DEFAULT_SHARPEN_STRENGTH
            },
        }
    }

    fn strength_for(&self, context: Option<&TileContext>) -> f32 {
        let Some(context) = context else {
            return self.sharpen_strength;
        };

        let analysis = context.analysis();
        if analysis.mentions_any(&GENTLE_TEXTURES) {
            self.sharpen_strength * 0.5
        } else if analysis.mentions_any(&DETAILED_TEXTURES) {
            self.sharpen_strength * 1.3
        } else {
            self.sharpen_strength
        }
    }
}

impl Default for LocalEnhancer {
    fn default() -> Self {
        Self::new(DEFAULT_SHARPEN_STRENGTH)
    }
}

impl TileEnhancer for LocalEnhancer {
    fn name(&self) -> &str {
        "LocalEnhancer"
    }

    fn enhance(
        &self,
        pixels: &RgbaImage,
        params: &EnhanceParams<'_>,
    ) -> Result<RgbaImage, EnhanceError> {
        let (width, height) = pixels.dimensions();
        let target_w = scale_dimension(width, params.scale);
        let target_h = scale_dimension(height, params.scale);
        if target_w == 0 || target_h == 0 {
            return Err(EnhanceError::failed(format!(
                "scale {} collapses {width}x{height} to an empty buffer",
                params.scale
            )));
        }

        let resized = if (target_w, target_h) == (width, height) {
            pixels.clone()
        } else {
            imageops::resize(pixels, target_w, target_h, imageops::FilterType::Lanczos3)
        };

        let pass = params.context.map(|c| c.pass).unwrap_or(1);
        let sigma = if pass >= 2 { 0.6 } else { 1.0 };
        let strength = self.strength_for(params.context);
        trace!(width, height, target_w, target_h, pass, strength, "Local enhancement");

        Ok(unsharp_mask(&resized, sigma, strength))
    }
}
