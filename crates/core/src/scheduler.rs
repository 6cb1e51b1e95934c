//! Bounded worker pool that runs the enhancement capability over a batch
//! of tiles.
//!
//! Workers are blocking tasks. Each claims the next tile index from a shared
//! counter, enhances it, and sends `(index, result)` back to the collector,
//! which slots results by index so output order always matches input order.
//! The first failure raises the cancel flag: no worker claims another tile
//! and the batch returns that error without partial results.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use image::imageops::{self, FilterType};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::enhancer::{EnhanceParams, TileEnhancer};
use crate::error::{UpscaleError, UpscaleResult};
use crate::types::{scale_dimension, EnhancedTile, ImageAnalysis, Tile, TileContext, TilePosition};

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const MAX_CONCURRENCY: usize = 32;

/// Invoked from worker threads with `(completed, total)` after each tile.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Batch-wide inputs shared by every tile in one scheduling round.
#[derive(Debug, Clone)]
pub struct BatchParams {
    pub prompt: String,
    pub scale: f64,
    /// Source image extent, used to classify tile positions.
    pub image_width: u32,
    pub image_height: u32,
    pub analysis: ImageAnalysis,
    pub pass: u32,
}

pub struct Scheduler {
    enhancer: Arc<dyn TileEnhancer>,
    concurrency: usize,
}

struct SharedBatch {
    tiles: Vec<Tile>,
    contexts: Vec<TileContext>,
    enhancer: Arc<dyn TileEnhancer>,
    prompt: String,
    scale: f64,
    next: AtomicUsize,
    completed: AtomicUsize,
    cancel: AtomicBool,
    progress: Option<ProgressCallback>,
}

type TileOutcome = (usize, UpscaleResult<EnhancedTile>);

impl Scheduler {
    pub fn new(enhancer: Arc<dyn TileEnhancer>, concurrency: usize) -> Self {
        Self {
            enhancer,
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Enhance every tile; `result[i]` corresponds to `tiles[i]`.
    pub async fn enhance_all(
        &self,
        tiles: Vec<Tile>,
        params: &BatchParams,
        progress: Option<ProgressCallback>,
    ) -> UpscaleResult<Vec<EnhancedTile>> {
        let total = tiles.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let workers = effective_concurrency(self.concurrency, total);
        let contexts = tiles
            .iter()
            .map(|tile| {
                let position =
                    TilePosition::classify(&tile.rect, params.image_width, params.image_height);
                TileContext::new(position, &params.analysis, params.pass)
            })
            .collect();

        let batch = Arc::new(SharedBatch {
            tiles,
            contexts,
            enhancer: Arc::clone(&self.enhancer),
            prompt: params.prompt.clone(),
            scale: params.scale,
            next: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            cancel: AtomicBool::new(false),
            progress,
        });

        info!(
            tiles = total,
            workers,
            pass = params.pass,
            scale = params.scale,
            enhancer = self.enhancer.name(),
            "Scheduling tile enhancement"
        );
        let started = Instant::now();

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<TileOutcome>();
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let batch = Arc::clone(&batch);
                let result_tx = result_tx.clone();
                tokio::task::spawn_blocking(move || run_worker(worker, &batch, &result_tx))
            })
            .collect();
        drop(result_tx);

        let mut slots: Vec<Option<EnhancedTile>> = std::iter::repeat_with(|| None).take(total).collect();
        let mut first_error: Option<UpscaleError> = None;

        while let Some((index, result)) = result_rx.recv().await {
            match result {
                Ok(tile) => slots[index] = Some(tile),
                Err(error) => {
                    batch.cancel.store(true, Ordering::Release);
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        for handle in handles {
            if let Err(join_error) = handle.await {
                batch.cancel.store(true, Ordering::Release);
                if first_error.is_none() {
                    first_error = Some(UpscaleError::Internal(format!(
                        "tile worker panicked: {join_error}"
                    )));
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        let enhanced = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| UpscaleError::Internal(format!("tile {index} produced no result")))
            })
            .collect::<UpscaleResult<Vec<_>>>()?;

        info!(
            tiles = total,
            pass = params.pass,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tile enhancement complete"
        );
        Ok(enhanced)
    }
}

/// Pool size clamped to `1..=MAX_CONCURRENCY` and never above the tile count.
pub fn effective_concurrency(requested: usize, tiles: usize) -> usize {
    requested.clamp(1, MAX_CONCURRENCY).min(tiles.max(1))
}

fn run_worker(worker: usize, batch: &SharedBatch, results: &mpsc::UnboundedSender<TileOutcome>) {
    let total = batch.tiles.len();
    loop {
        if batch.cancel.load(Ordering::Acquire) {
            break;
        }
        let index = batch.next.fetch_add(1, Ordering::AcqRel);
        if index >= total {
            break;
        }

        let result = enhance_one(batch, index);
        let failed = result.is_err();
        if failed {
            batch.cancel.store(true, Ordering::Release);
        } else {
            let done = batch.completed.fetch_add(1, Ordering::AcqRel) + 1;
            if let Some(progress) = batch.progress.as_deref() {
                progress(done, total);
            }
        }

        if results.send((index, result)).is_err() || failed {
            break;
        }
    }
    debug!(worker, "Tile worker finished");
}

fn enhance_one(batch: &SharedBatch, index: usize) -> UpscaleResult<EnhancedTile> {
    let tile = &batch.tiles[index];
    let (x, y) = (tile.rect.x, tile.rect.y);
    let expected = (
        scale_dimension(tile.pixels.width(), batch.scale),
        scale_dimension(tile.pixels.height(), batch.scale),
    );
    if expected.0 == 0 || expected.1 == 0 {
        return Err(UpscaleError::EnhancementFailed {
            index,
            x,
            y,
            source: anyhow!(
                "scale {} collapses a {}x{} tile",
                batch.scale,
                tile.pixels.width(),
                tile.pixels.height()
            ),
        });
    }

    let params = EnhanceParams {
        prompt: &batch.prompt,
        scale: batch.scale,
        context: Some(&batch.contexts[index]),
    };
    let started = Instant::now();
    let mut pixels = batch
        .enhancer
        .enhance(&tile.pixels, &params)
        .map_err(|error| UpscaleError::from_enhance(index, x, y, error))?;

    if pixels.width() == 0 || pixels.height() == 0 {
        return Err(UpscaleError::EnhancementFailed {
            index,
            x,
            y,
            source: anyhow!("enhancer returned an empty buffer"),
        });
    }

    if pixels.dimensions() != expected {
        debug!(
            index,
            got = ?pixels.dimensions(),
            ?expected,
            "Resampling enhancer output to expected tile size"
        );
        pixels = imageops::resize(&pixels, expected.0, expected.1, FilterType::Lanczos3);
    }

    debug!(
        index,
        x,
        y,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Tile enhanced"
    );
    Ok(EnhancedTile {
        rect: tile.rect,
        pixels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use image::{Rgba, RgbaImage};

    use crate::error::EnhanceError;
    use crate::tiling::decompose;
    use crate::types::TileRect;

    fn batch(scale: f64, width: u32, height: u32) -> BatchParams {
        BatchParams {
            prompt: "upscale".to_string(),
            scale,
            image_width: width,
            image_height: height,
            analysis: ImageAnalysis::default(),
            pass: 1,
        }
    }

    /// Tiles whose red channel encodes their index.
    fn marked_tiles(count: usize) -> Vec<Tile> {
        (0..count)
            .map(|i| Tile {
                rect: TileRect::new(i as u32 * 8, 0, 8, 8),
                pixels: RgbaImage::from_pixel(8, 8, Rgba([i as u8, 10, 20, 255])),
            })
            .collect()
    }

    fn nearest_upscale(pixels: &RgbaImage, scale: f64) -> RgbaImage {
        let (w, h) = pixels.dimensions();
        imageops::resize(
            pixels,
            scale_dimension(w, scale),
            scale_dimension(h, scale),
            FilterType::Nearest,
        )
    }

    /// Sleeps a pseudo-random amount per tile so completions arrive out of order.
    struct JitterEnhancer;

    impl TileEnhancer for JitterEnhancer {
        fn enhance(
            &self,
            pixels: &RgbaImage,
            params: &EnhanceParams<'_>,
        ) -> Result<RgbaImage, EnhanceError> {
            let marker = pixels.get_pixel(0, 0).0[0] as u64;
            std::thread::sleep(Duration::from_millis((marker * 7919) % 13));
            Ok(nearest_upscale(pixels, params.scale))
        }
    }

    struct FailOn {
        marker: u8,
        timeout: bool,
    }

    impl TileEnhancer for FailOn {
        fn enhance(
            &self,
            pixels: &RgbaImage,
            params: &EnhanceParams<'_>,
        ) -> Result<RgbaImage, EnhanceError> {
            if pixels.get_pixel(0, 0).0[0] != self.marker {
                return Ok(nearest_upscale(pixels, params.scale));
            }
            if self.timeout {
                Err(EnhanceError::TimedOut {
                    elapsed: Duration::from_secs(60),
                    message: "model did not answer".to_string(),
                })
            } else {
                Err(EnhanceError::failed("model rejected tile"))
            }
        }
    }

    #[derive(Default)]
    struct InFlightProbe {
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl TileEnhancer for InFlightProbe {
        fn enhance(
            &self,
            pixels: &RgbaImage,
            params: &EnhanceParams<'_>,
        ) -> Result<RgbaImage, EnhanceError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(nearest_upscale(pixels, params.scale))
        }
    }

    #[derive(Default)]
    struct ContextRecorder {
        seen: Mutex<Vec<(String, u32, String)>>,
    }

    impl TileEnhancer for ContextRecorder {
        fn enhance(
            &self,
            pixels: &RgbaImage,
            params: &EnhanceParams<'_>,
        ) -> Result<RgbaImage, EnhanceError> {
            let context = params.context.ok_or_else(|| EnhanceError::failed("no context"))?;
            self.seen
                .lock()
                .map_err(|_| EnhanceError::failed("poisoned"))?
                .push((
                    context.position.label().to_string(),
                    context.pass,
                    context.image_description.clone(),
                ));
            Ok(nearest_upscale(pixels, params.scale))
        }
    }

    fn wrong_size(pixels: &RgbaImage, _params: &EnhanceParams<'_>) -> Result<RgbaImage, EnhanceError> {
        Ok(RgbaImage::from_pixel(
            pixels.width() + 3,
            pixels.height() + 1,
            Rgba([40, 50, 60, 255]),
        ))
    }

    #[test]
    fn test_effective_concurrency_clamps() {
        assert_eq!(effective_concurrency(0, 10), 1);
        assert_eq!(effective_concurrency(5, 3), 3);
        assert_eq!(effective_concurrency(100, 1000), MAX_CONCURRENCY);
        assert_eq!(effective_concurrency(5, 0), 1);
    }

    #[tokio::test]
    async fn test_results_follow_input_order_under_jitter() {
        let scheduler = Scheduler::new(Arc::new(JitterEnhancer), 4);
        let tiles = marked_tiles(24);
        let rects: Vec<_> = tiles.iter().map(|t| t.rect).collect();

        let enhanced = scheduler
            .enhance_all(tiles, &batch(2.0, 192, 8), None)
            .await
            .expect("enhance batch");

        assert_eq!(enhanced.len(), 24);
        for (index, tile) in enhanced.iter().enumerate() {
            assert_eq!(tile.rect, rects[index]);
            assert_eq!(tile.pixels.dimensions(), (16, 16));
            assert_eq!(tile.pixels.get_pixel(5, 5).0[0], index as u8);
        }
    }

    #[tokio::test]
    async fn test_failure_is_terminal_and_carries_tile_identity() {
        let scheduler = Scheduler::new(
            Arc::new(FailOn {
                marker: 3,
                timeout: false,
            }),
            2,
        );

        let error = scheduler
            .enhance_all(marked_tiles(10), &batch(2.0, 80, 8), None)
            .await
            .expect_err("tile 3 fails");

        assert_eq!(error.code(), "enhancement_failed");
        match error {
            UpscaleError::EnhancementFailed { index, x, y, .. } => {
                assert_eq!((index, x, y), (3, 24, 0));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_capability_timeout_surfaces_as_timed_out() {
        let scheduler = Scheduler::new(
            Arc::new(FailOn {
                marker: 0,
                timeout: true,
            }),
            3,
        );

        let error = scheduler
            .enhance_all(marked_tiles(4), &batch(1.0, 32, 8), None)
            .await
            .expect_err("tile 0 times out");
        assert_eq!(error.code(), "timed_out");
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_concurrency_limit() {
        let probe = Arc::new(InFlightProbe::default());
        let scheduler = Scheduler::new(probe.clone(), 3);

        scheduler
            .enhance_all(marked_tiles(15), &batch(1.0, 120, 8), None)
            .await
            .expect("enhance batch");

        assert_eq!(probe.calls.load(Ordering::SeqCst), 15);
        let peak = probe.peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak in-flight was {peak}");
    }

    #[tokio::test]
    async fn test_512_image_schedules_nine_calls_at_double_scale() {
        let image = RgbaImage::from_pixel(512, 512, Rgba([90, 90, 90, 255]));
        let decomposition = decompose(&image, 256, 64).expect("decompose");
        let probe = Arc::new(InFlightProbe::default());
        let scheduler = Scheduler::new(probe.clone(), DEFAULT_CONCURRENCY);

        let enhanced = scheduler
            .enhance_all(decomposition.tiles, &batch(2.0, 512, 512), None)
            .await
            .expect("enhance batch");

        assert_eq!(probe.calls.load(Ordering::SeqCst), 9);
        assert_eq!(enhanced.len(), 9);
        assert_eq!(enhanced[0].pixels.dimensions(), (512, 512));
        assert_eq!(enhanced[8].pixels.dimensions(), (256, 256));
    }

    #[tokio::test]
    async fn test_mismatched_output_is_resampled() {
        let scheduler = Scheduler::new(Arc::new(wrong_size), 2);
        let enhanced = scheduler
            .enhance_all(marked_tiles(3), &batch(2.0, 24, 8), None)
            .await
            .expect("enhance batch");

        for tile in &enhanced {
            assert_eq!(tile.pixels.dimensions(), (16, 16));
        }
    }

    #[tokio::test]
    async fn test_progress_reaches_total() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let progress: ProgressCallback = Arc::new(move |done, total| {
            sink.lock().expect("progress lock").push((done, total));
        });

        let scheduler = Scheduler::new(Arc::new(JitterEnhancer), 3);
        scheduler
            .enhance_all(marked_tiles(7), &batch(1.0, 56, 8), Some(progress))
            .await
            .expect("enhance batch");

        let mut reports = reports.lock().expect("progress lock").clone();
        reports.sort_unstable();
        assert_eq!(reports.len(), 7);
        assert_eq!(reports.last(), Some(&(7, 7)));
        assert!(reports.iter().all(|&(_, total)| total == 7));
    }

    #[tokio::test]
    async fn test_tiles_receive_position_and_analysis_context() {
        let recorder = Arc::new(ContextRecorder::default());
        let scheduler = Scheduler::new(recorder.clone(), 1);
        let image = RgbaImage::from_pixel(300, 300, Rgba([1, 2, 3, 255]));
        let decomposition = decompose(&image, 100, 0).expect("decompose");

        let mut params = batch(1.0, 300, 300);
        params.pass = 2;
        params.analysis.description = "a harbour at dusk".to_string();
        scheduler
            .enhance_all(decomposition.tiles, &params, None)
            .await
            .expect("enhance batch");

        let seen = recorder.seen.lock().expect("recorder lock");
        assert_eq!(seen.len(), 9);
        // One worker claims tiles strictly in order.
        assert_eq!(seen[0].0, "top-left corner");
        assert_eq!(seen[4].0, "center");
        assert_eq!(seen[8].0, "bottom-right corner");
        assert!(seen.iter().all(|(_, pass, description)| *pass == 2 && description == "a harbour at dusk"));
    }

    #[tokio::test]
    async fn test_empty_batch_is_ok() {
        let scheduler = Scheduler::new(Arc::new(JitterEnhancer), 5);
        let enhanced = scheduler
            .enhance_all(Vec::new(), &batch(2.0, 0, 0), None)
            .await
            .expect("empty batch");
        assert!(enhanced.is_empty());
    }
}
