//! End-to-end orchestration: validate, plan, analyze, decompose, enhance,
//! refine, merge, post-process.

use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, DEFAULT_SCALE};
use crate::enhancer::{ImageAnalyzer, TileEnhancer};
use crate::error::{UpscaleError, UpscaleResult};
use crate::merge::{merge, MergeParams};
use crate::postprocess::{post_process, PostProcessOptions};
use crate::refine::{clamp_passes, refine};
use crate::scheduler::{BatchParams, ProgressCallback, Scheduler, DEFAULT_CONCURRENCY};
use crate::tiling::{
    count_tiles, decompose_with_limit, plan_grid, validate_tiling, DEFAULT_MAX_TILES, DEFAULT_TILE_OVERLAP,
    DEFAULT_TILE_SIZE,
};
use crate::types::ImageAnalysis;

pub const MAX_SCALE: f64 = 8.0;

/// Tunables of one upscale request. Quality knobs are 0..=100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleOptions {
    pub tile_size: u32,
    pub overlap: u32,
    pub upscale_factor: f64,
    pub prompt: String,
    pub enhancement_passes: u32,
    pub sharpness: f32,
    pub denoise: f32,
    pub contrast: f32,
}

impl Default for UpscaleOptions {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_TILE_OVERLAP,
            upscale_factor: DEFAULT_SCALE,
            prompt: String::new(),
            enhancement_passes: 1,
            sharpness: 0.0,
            denoise: 0.0,
            contrast: 50.0,
        }
    }
}

impl UpscaleOptions {
    pub fn validate(&self) -> UpscaleResult<()> {
        validate_tiling(self.tile_size, self.overlap)?;
        if !self.upscale_factor.is_finite()
            || self.upscale_factor <= 0.0
            || self.upscale_factor > MAX_SCALE
        {
            return Err(UpscaleError::InvalidParameter(format!(
                "upscale_factor must be in (0, {MAX_SCALE}], got {}",
                self.upscale_factor
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UpscaleRequest {
    pub image: RgbaImage,
    pub options: UpscaleOptions,
}

impl UpscaleRequest {
    pub fn new(image: RgbaImage, options: UpscaleOptions) -> Self {
        Self { image, options }
    }
}

#[derive(Debug, Clone)]
pub struct UpscaleResponse {
    pub image: RgbaImage,
    pub tiles_processed: usize,
    /// Whether a generative capability produced the tiles.
    pub ai_enhanced: bool,
    pub passes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub concurrency: usize,
    pub max_tiles: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_tiles: DEFAULT_MAX_TILES,
        }
    }
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.scheduler.concurrency,
            max_tiles: config.tiling.max_tiles,
        }
    }
}

pub struct Pipeline {
    enhancer: Arc<dyn TileEnhancer>,
    analyzer: Arc<dyn ImageAnalyzer>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        enhancer: Arc<dyn TileEnhancer>,
        analyzer: Arc<dyn ImageAnalyzer>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            enhancer,
            analyzer,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Number of enhancement calls a request will make, counting every pass.
    /// Fails the same way `run` would on invalid geometry or tile count.
    pub fn planned_calls(&self, width: u32, height: u32, options: &UpscaleOptions) -> UpscaleResult<usize> {
        options.validate()?;
        let tiles = self.check_plan(width, height, options)?;
        Ok(tiles * clamp_passes(options.enhancement_passes) as usize)
    }

    /// `progress` receives `(completed, total)` over all enhancement calls.
    pub async fn run(
        &self,
        request: UpscaleRequest,
        progress: Option<ProgressCallback>,
    ) -> UpscaleResult<UpscaleResponse> {
        let UpscaleRequest { image, options } = request;
        let started = Instant::now();

        options.validate()?;
        let (width, height) = image.dimensions();
        let tile_count = self.check_plan(width, height, &options)?;
        let passes = clamp_passes(options.enhancement_passes);
        info!(
            width,
            height,
            tile_size = options.tile_size,
            overlap = options.overlap,
            scale = options.upscale_factor,
            tiles = tile_count,
            passes,
            "Starting upscale"
        );

        let image = Arc::new(image);
        let analysis = self.analyze(Arc::clone(&image)).await?;

        let stage = Instant::now();
        let (tile_size, overlap, max_tiles) = (options.tile_size, options.overlap, self.settings.max_tiles);
        let source = Arc::clone(&image);
        let decomposition = tokio::task::spawn_blocking(move || {
            decompose_with_limit(&source, tile_size, overlap, max_tiles)
        })
        .await
        .map_err(|join_error| join_failure("decompose", join_error))??;
        drop(image);
        debug!(
            tiles = decomposition.tiles.len(),
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "Decomposition finished"
        );

        let total_calls = tile_count * passes as usize;
        let scheduler = Scheduler::new(Arc::clone(&self.enhancer), self.settings.concurrency);
        let batch = BatchParams {
            prompt: options.prompt.clone(),
            scale: options.upscale_factor,
            image_width: width,
            image_height: height,
            analysis,
            pass: 1,
        };

        let first_pass_progress = progress.as_ref().map(|callback| {
            let callback = Arc::clone(callback);
            Arc::new(move |done: usize, _: usize| callback(done, total_calls)) as ProgressCallback
        });
        let enhanced = scheduler
            .enhance_all(decomposition.tiles, &batch, first_pass_progress)
            .await?;

        let refine_progress = progress.as_ref().map(|callback| {
            let callback = Arc::clone(callback);
            Arc::new(move |done: usize, _: usize| callback(tile_count + done, total_calls))
                as ProgressCallback
        });
        let enhanced = refine(&scheduler, enhanced, passes, &batch, refine_progress).await?;
        let tiles_processed = enhanced.len();

        let stage = Instant::now();
        let merge_params = MergeParams {
            original_width: width,
            original_height: height,
            tile_size: options.tile_size,
            overlap: options.overlap,
            scale: options.upscale_factor,
        };
        let post = PostProcessOptions::from_quality(options.sharpness, options.denoise, options.contrast);
        let output = tokio::task::spawn_blocking(move || {
            let merged = merge(&enhanced, &merge_params)?;
            Ok::<_, UpscaleError>(post_process(&merged, &post))
        })
        .await
        .map_err(|join_error| join_failure("merge", join_error))??;
        debug!(
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "Merge and post-processing finished"
        );

        info!(
            output_width = output.width(),
            output_height = output.height(),
            tiles_processed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upscale complete"
        );

        Ok(UpscaleResponse {
            image: output,
            tiles_processed,
            ai_enhanced: self.enhancer.is_ai(),
            passes,
        })
    }

    /// Geometry checks that must pass before any capability call: image
    /// size, tile limit, and every planned tile keeping at least one output
    /// pixel per axis at the requested scale.
    fn check_plan(&self, width: u32, height: u32, options: &UpscaleOptions) -> UpscaleResult<usize> {
        if width == 0 || height == 0 {
            return Err(UpscaleError::InvalidImage(format!(
                "image has zero dimension ({width}x{height})"
            )));
        }
        let tiles = count_tiles(width, height, options.tile_size, options.overlap)?;
        if tiles > self.settings.max_tiles {
            return Err(UpscaleError::TileLimitExceeded {
                tiles,
                limit: self.settings.max_tiles,
            });
        }

        let scale = options.upscale_factor;
        let plan = plan_grid(width, height, options.tile_size, options.overlap)?;
        if let Some(rect) = plan.iter().find(|rect| {
            let (w, h) = rect.scaled_size(scale);
            w == 0 || h == 0
        }) {
            return Err(UpscaleError::InvalidParameter(format!(
                "upscale_factor {scale} collapses the {}x{} tile at ({}, {})",
                rect.width, rect.height, rect.x, rect.y
            )));
        }
        Ok(tiles)
    }

    /// Analysis is optional context; a failing analyzer only costs a warning.
    async fn analyze(&self, image: Arc<RgbaImage>) -> UpscaleResult<ImageAnalysis> {
        let analyzer = Arc::clone(&self.analyzer);
        let outcome = tokio::task::spawn_blocking(move || analyzer.analyze(&image))
            .await
            .map_err(|join_error| join_failure("analyze", join_error))?;

        Ok(match outcome {
            Ok(analysis) => {
                debug!(
                    textures = analysis.textures.len(),
                    subjects = analysis.subjects.len(),
                    "Image analysis finished"
                );
                analysis
            }
            Err(error) => {
                warn!(error = %format!("{error:#}"), "Image analysis failed; continuing without context");
                ImageAnalysis::default()
            }
        })
    }
}

fn join_failure(stage: &str, join_error: tokio::task::JoinError) -> UpscaleError {
    UpscaleError::Internal(format!("{stage} task failed: {join_error}"))
}
