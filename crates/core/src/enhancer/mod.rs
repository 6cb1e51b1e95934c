//! Capabilities consumed by the pipeline: tile enhancement and optional
//! image analysis. The core never cares whether a capability runs local
//! filters or calls a remote model.

mod http;
mod local;

pub use http::{
    HttpEnhancer, HttpEnhancerOptions, DEFAULT_MAX_RESPONSE_BYTES, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_BACKOFF_MS, DEFAULT_TIMEOUT_MS,
};
pub use local::{LocalEnhancer, DEFAULT_SHARPEN_STRENGTH};

use anyhow::Result;
use image::RgbaImage;

use crate::error::EnhanceError;
use crate::types::{ImageAnalysis, TileContext};

/// Per-call parameters handed to a [`TileEnhancer`].
#[derive(Debug, Clone, Copy)]
pub struct EnhanceParams<'a> {
    pub prompt: &'a str,
    pub scale: f64,
    pub context: Option<&'a TileContext>,
}

/// Transforms (and optionally upscales) one RGBA buffer.
///
/// Implementations must return a buffer of `round(w × scale)` ×
/// `round(h × scale)` or fail. Retries, if any, happen inside the
/// implementation.
pub trait TileEnhancer: Send + Sync {
    fn name(&self) -> &str {
        "TileEnhancer"
    }

    /// Whether results come from a generative model rather than local filters.
    fn is_ai(&self) -> bool {
        false
    }

    fn enhance(
        &self,
        pixels: &RgbaImage,
        params: &EnhanceParams<'_>,
    ) -> std::result::Result<RgbaImage, EnhanceError>;
}

impl<F> TileEnhancer for F
where
    F: Fn(&RgbaImage, &EnhanceParams<'_>) -> std::result::Result<RgbaImage, EnhanceError>
        + Send
        + Sync,
{
    fn enhance(
        &self,
        pixels: &RgbaImage,
        params: &EnhanceParams<'_>,
    ) -> std::result::Result<RgbaImage, EnhanceError> {
        self(pixels, params)
    }
}

/// Produces descriptive context for a whole image.
pub trait ImageAnalyzer: Send + Sync {
    fn analyze(&self, image: &RgbaImage) -> Result<ImageAnalysis>;
}

/// The "no analysis capability configured" case.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAnalyzer;

impl ImageAnalyzer for NoAnalyzer {
    fn analyze(&self, _image: &RgbaImage) -> Result<ImageAnalysis> {
        Ok(ImageAnalysis::default())
    }
}

/// Returns an analysis supplied up front by the caller.
#[derive(Debug, Clone, Default)]
pub struct FixedAnalyzer {
    analysis: ImageAnalysis,
}

impl FixedAnalyzer {
    pub fn new(analysis: ImageAnalysis) -> Self {
        Self { analysis }
    }
}

impl ImageAnalyzer for FixedAnalyzer {
    fn analyze(&self, _image: &RgbaImage) -> Result<ImageAnalysis> {
        Ok(self.analysis.clone())
    }
}
