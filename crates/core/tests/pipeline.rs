use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{imageops, Rgba, RgbaImage};
use seamless_core::enhancer::{EnhanceParams, FixedAnalyzer, NoAnalyzer, TileEnhancer};
use seamless_core::error::EnhanceError;
use seamless_core::merge::{merge, MergeParams};
use seamless_core::tiling::decompose;
use seamless_core::types::{EnhancedTile, ImageAnalysis};
use seamless_core::{Pipeline, PipelineSettings, UpscaleError, UpscaleOptions, UpscaleRequest};

fn gradient(w: u32, h: u32) -> RgbaImage {
    RgbaImage::from_fn(w, h, |x, y| {
        Rgba([
            (x * 255 / w.max(2)) as u8,
            (y * 255 / h.max(2)) as u8,
            ((x * 3 + y * 5) % 256) as u8,
            255,
        ])
    })
}

/// Bilinear upscale with a content-dependent delay so tiles finish out of order.
struct SlowBilinear {
    calls: AtomicUsize,
}

impl TileEnhancer for SlowBilinear {
    fn name(&self) -> &str {
        "SlowBilinear"
    }

    fn enhance(
        &self,
        pixels: &RgbaImage,
        params: &EnhanceParams<'_>,
    ) -> Result<RgbaImage, EnhanceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
        std::thread::sleep(Duration::from_millis((call * 37) % 11));
        let (w, h) = pixels.dimensions();
        Ok(imageops::resize(
            pixels,
            (w as f64 * params.scale).round() as u32,
            (h as f64 * params.scale).round() as u32,
            imageops::FilterType::Triangle,
        ))
    }
}

fn slow_pipeline(concurrency: usize) -> (Arc<SlowBilinear>, Pipeline) {
    let enhancer = Arc::new(SlowBilinear {
        calls: AtomicUsize::new(0),
    });
    let pipeline = Pipeline::new(
        enhancer.clone(),
        Arc::new(NoAnalyzer),
        PipelineSettings {
            concurrency,
            max_tiles: 500,
        },
    );
    (enhancer, pipeline)
}

#[tokio::test]
async fn pipeline_output_is_identical_across_runs_and_pool_sizes() {
    let source = gradient(333, 217);
    let options = UpscaleOptions {
        tile_size: 96,
        overlap: 24,
        upscale_factor: 2.0,
        sharpness: 30.0,
        ..UpscaleOptions::default()
    };

    let (_, single) = slow_pipeline(1);
    let (_, wide) = slow_pipeline(8);

    let first = single
        .run(UpscaleRequest::new(source.clone(), options.clone()), None)
        .await
        .expect("single-worker run");
    let second = wide
        .run(UpscaleRequest::new(source, options), None)
        .await
        .expect("eight-worker run");

    assert_eq!(first.image.dimensions(), (666, 434));
    assert_eq!(first.tiles_processed, second.tiles_processed);
    assert_eq!(first.image.as_raw(), second.image.as_raw());
}

#[tokio::test]
async fn pipeline_has_no_visible_seams_on_smooth_input() {
    let source = gradient(256, 256);
    let options = UpscaleOptions {
        tile_size: 80,
        overlap: 32,
        upscale_factor: 2.0,
        ..UpscaleOptions::default()
    };
    let (enhancer, pipeline) = slow_pipeline(4);

    let response = pipeline
        .run(UpscaleRequest::new(source, options), None)
        .await
        .expect("upscale");

    assert!(enhancer.calls.load(Ordering::SeqCst) > 1);
    // Green follows y only; every row must stay flat across tile borders.
    let output = &response.image;
    for y in (0..output.height()).step_by(17) {
        let row: Vec<u8> = (0..output.width()).map(|x| output.get_pixel(x, y).0[1]).collect();
        let (min, max) = row
            .iter()
            .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        assert!(max - min <= 2, "row {y} varies from {min} to {max}");
    }
}

#[test]
fn merge_is_independent_of_tile_order() {
    let source = gradient(200, 150);
    let decomposition = decompose(&source, 64, 16).expect("decompose");
    let tiles: Vec<EnhancedTile> = decomposition
        .tiles
        .into_iter()
        .map(|tile| EnhancedTile {
            rect: tile.rect,
            pixels: imageops::resize(
                &tile.pixels,
                tile.pixels.width() * 3,
                tile.pixels.height() * 3,
                imageops::FilterType::CatmullRom,
            ),
        })
        .collect();
    let params = MergeParams {
        original_width: 200,
        original_height: 150,
        tile_size: 64,
        overlap: 16,
        scale: 3.0,
    };

    let forward = merge(&tiles, &params).expect("forward merge");
    let mut shuffled = tiles.clone();
    shuffled.rotate_left(5);
    shuffled.swap(0, 3);
    let reordered = merge(&shuffled, &params).expect("shuffled merge");

    assert_eq!(forward.dimensions(), (600, 450));
    assert_eq!(forward.as_raw(), reordered.as_raw());
}

#[tokio::test]
async fn analysis_context_and_error_bodies_reach_the_caller() {
    struct RejectsFoliage;

    impl TileEnhancer for RejectsFoliage {
        fn enhance(
            &self,
            pixels: &RgbaImage,
            params: &EnhanceParams<'_>,
        ) -> Result<RgbaImage, EnhanceError> {
            let foliage = params
                .context
                .is_some_and(|context| context.textures.iter().any(|t| t == "foliage"));
            if foliage {
                return Err(EnhanceError::failed("foliage is not supported"));
            }
            Ok(pixels.clone())
        }
    }

    let analysis = ImageAnalysis {
        description: "forest".to_string(),
        textures: vec!["foliage".to_string()],
        subjects: vec!["trees".to_string()],
    };
    let pipeline = Pipeline::new(
        Arc::new(RejectsFoliage),
        Arc::new(FixedAnalyzer::new(analysis)),
        PipelineSettings::default(),
    );
    let options = UpscaleOptions {
        upscale_factor: 1.0,
        ..UpscaleOptions::default()
    };

    let error = pipeline
        .run(UpscaleRequest::new(gradient(64, 64), options), None)
        .await
        .expect_err("enhancer rejects the only tile");

    assert!(matches!(error, UpscaleError::EnhancementFailed { index: 0, .. }));
    let body = serde_json::to_value(error.to_body()).expect("serialize error body");
    assert_eq!(body["kind"], "enhancement_failed");
    assert!(body["message"]
        .as_str()
        .is_some_and(|message| message.contains("foliage is not supported")));
}
