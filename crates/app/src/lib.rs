use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use image::{DynamicImage, ImageFormat, RgbaImage};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use seamless_core::config::{config_path, data_dir, initialize_data_dir, AppConfig, EnhancerBackend};
use seamless_core::enhancer::{
    FixedAnalyzer, HttpEnhancer, ImageAnalyzer, LocalEnhancer, NoAnalyzer, TileEnhancer,
};
use seamless_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RedactingMakeWriter,
    DEFAULT_LOG_FILTER,
};
use seamless_core::merge::MergeParams;
use seamless_core::scheduler::ProgressCallback;
use seamless_core::tiling::plan_grid;
use seamless_core::types::ImageAnalysis;
use seamless_core::{Pipeline, PipelineSettings, UpscaleOptions, UpscaleRequest};

#[derive(Parser)]
#[command(
    name = "seamless",
    about = "Tile-based image upscaling with seam-free reconstruction"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory holding config.toml and logs")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale an image tile by tile and write the reconstructed result.
    Upscale(UpscaleArgs),
    /// Print the tile grid for an image without enhancing anything.
    Plan(PlanArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Local,
    Http,
}

impl From<BackendArg> for EnhancerBackend {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Local => EnhancerBackend::Local,
            BackendArg::Http => EnhancerBackend::Http,
        }
    }
}

#[derive(Args, Debug)]
struct GridArgs {
    #[arg(long, help = "Upscale factor (default from config)")]
    scale: Option<f64>,
    #[arg(long, help = "Tile edge length in source pixels (default from config)")]
    tile_size: Option<u32>,
    #[arg(long, help = "Overlap between neighbouring tiles (default from config)")]
    overlap: Option<u32>,
}

#[derive(Args, Debug)]
struct UpscaleArgs {
    #[arg(help = "Source image")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Destination image; format follows the extension")]
    output: PathBuf,
    #[command(flatten)]
    grid: GridArgs,
    #[arg(long, default_value = "", help = "Prompt forwarded to the enhancer")]
    prompt: String,
    #[arg(long, default_value_t = 1, help = "Enhancement passes (1-4)")]
    passes: u32,
    #[arg(long, default_value_t = 0.0, help = "Post-sharpening strength (0-100)")]
    sharpness: f32,
    #[arg(long, default_value_t = 0.0, help = "Post-denoise strength (0-100)")]
    denoise: f32,
    #[arg(long, default_value_t = 50.0, help = "Contrast (0-100, 50 is neutral)")]
    contrast: f32,
    #[arg(long, help = "Concurrent enhancement calls (default from config)")]
    concurrency: Option<usize>,
    #[arg(long, value_enum, help = "Enhancement backend (default from config)")]
    backend: Option<BackendArg>,
    #[arg(long, help = "HTTP enhancer endpoint (implies --backend http)")]
    endpoint: Option<String>,
    #[arg(long, value_name = "TEXT", help = "Image description handed to the enhancer")]
    describe: Option<String>,
    #[arg(long = "texture", value_name = "TEXTURE", help = "Dominant texture (repeatable)")]
    textures: Vec<String>,
    #[arg(long = "subject", value_name = "SUBJECT", help = "Main subject (repeatable)")]
    subjects: Vec<String>,
    #[arg(long, help = "Print a JSON summary (or error body) to stdout")]
    json: bool,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[arg(help = "Source image")]
    input: PathBuf,
    #[command(flatten)]
    grid: GridArgs,
    #[arg(long, help = "Print the plan as JSON")]
    json: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);
    let config = load_config(&resolved_data_dir);

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, &config).await,
        Commands::Plan(args) => run_plan(args, &config),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: crash report hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted."
        );
    }

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let file_filter = parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(RedactingMakeWriter::new(ready.appender))
                    .with_filter(file_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %fallback.reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Crash report hook unavailable; continuing without crash reports"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(error) = initialize_data_dir(data_dir) {
        warn!(error = %format!("{error:#}"), "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn resolve_options(args: &UpscaleArgs, config: &AppConfig) -> UpscaleOptions {
    UpscaleOptions {
        tile_size: args.grid.tile_size.unwrap_or(config.tiling.tile_size),
        overlap: args.grid.overlap.unwrap_or(config.tiling.overlap),
        upscale_factor: args.grid.scale.unwrap_or(config.output.default_scale),
        prompt: args.prompt.clone(),
        enhancement_passes: args.passes,
        sharpness: args.sharpness,
        denoise: args.denoise,
        contrast: args.contrast,
    }
}

fn resolve_backend(args: &UpscaleArgs, config: &AppConfig) -> EnhancerBackend {
    match (args.backend, args.endpoint.is_some()) {
        (Some(backend), _) => backend.into(),
        (None, true) => EnhancerBackend::Http,
        (None, false) => config.enhancer.backend,
    }
}

fn build_enhancer(args: &UpscaleArgs, config: &AppConfig) -> Result<Arc<dyn TileEnhancer>> {
    match resolve_backend(args, config) {
        EnhancerBackend::Local => Ok(Arc::new(LocalEnhancer::new(
            config.enhancer.sharpen_strength,
        ))),
        EnhancerBackend::Http => {
            let mut enhancer_config = config.enhancer.clone();
            if let Some(endpoint) = &args.endpoint {
                enhancer_config.endpoint = Some(endpoint.clone());
            }
            let options = enhancer_config.http_options()?;
            Ok(Arc::new(HttpEnhancer::new(options)?))
        }
    }
}

fn build_analyzer(args: &UpscaleArgs) -> Arc<dyn ImageAnalyzer> {
    let analysis = ImageAnalysis {
        description: args.describe.clone().unwrap_or_default(),
        textures: args.textures.clone(),
        subjects: args.subjects.clone(),
    };
    if analysis.is_empty() {
        Arc::new(NoAnalyzer)
    } else {
        Arc::new(FixedAnalyzer::new(analysis))
    }
}

async fn run_upscale(args: UpscaleArgs, config: &AppConfig) -> Result<()> {
    if !args.input.exists() {
        bail!("Input image does not exist: {}", args.input.display());
    }

    let options = resolve_options(&args, config);
    let enhancer = build_enhancer(&args, config)?;
    let analyzer = build_analyzer(&args);
    let mut settings = PipelineSettings::from(config);
    if let Some(concurrency) = args.concurrency {
        settings.concurrency = concurrency;
    }

    info!(input = %args.input.display(), "Loading image");
    let source = load_rgba(&args.input)?;
    let pipeline = Pipeline::new(enhancer, analyzer, settings);
    let planned = pipeline
        .planned_calls(source.width(), source.height(), &options)
        .map_err(|error| report_failure(&error, args.json))?;
    info!(
        enhancer_calls = planned,
        concurrency = settings.concurrency,
        "Upscale planned"
    );

    let started = Instant::now();
    let response = pipeline
        .run(UpscaleRequest::new(source, options), Some(make_progress_callback()))
        .await
        .map_err(|error| {
            eprintln!();
            report_failure(&error, args.json)
        })?;
    eprintln!();

    save_image(&response.image, &args.output)?;
    info!(
        output = %args.output.display(),
        width = response.image.width(),
        height = response.image.height(),
        tiles_processed = response.tiles_processed,
        ai_enhanced = response.ai_enhanced,
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Upscale completed successfully"
    );

    if args.json {
        let summary = serde_json::json!({
            "output": args.output.display().to_string(),
            "width": response.image.width(),
            "height": response.image.height(),
            "tiles_processed": response.tiles_processed,
            "ai_enhanced": response.ai_enhanced,
            "passes": response.passes,
        });
        println!("{summary}");
    }
    Ok(())
}

fn report_failure(error: &seamless_core::UpscaleError, json: bool) -> anyhow::Error {
    error!(kind = error.code(), "Upscale failed");
    if json {
        if let Ok(body) = serde_json::to_string(&error.to_body()) {
            println!("{body}");
        }
    }
    anyhow::anyhow!("{error}")
}

/// Grid geometry for `plan`, checked the same way an upscale request is.
fn resolve_plan_geometry(grid: &GridArgs, config: &AppConfig) -> Result<UpscaleOptions> {
    let options = UpscaleOptions {
        tile_size: grid.tile_size.unwrap_or(config.tiling.tile_size),
        overlap: grid.overlap.unwrap_or(config.tiling.overlap),
        upscale_factor: grid.scale.unwrap_or(config.output.default_scale),
        ..UpscaleOptions::default()
    };
    options.validate()?;
    Ok(options)
}

fn run_plan(args: PlanArgs, config: &AppConfig) -> Result<()> {
    let options = resolve_plan_geometry(&args.grid, config)?;
    let (tile_size, overlap, scale) = (options.tile_size, options.overlap, options.upscale_factor);
    let (width, height) = image::image_dimensions(&args.input)
        .with_context(|| format!("Failed to read image header: {}", args.input.display()))?;

    let rects = plan_grid(width, height, tile_size, overlap)?;
    let geometry = MergeParams {
        original_width: width,
        original_height: height,
        tile_size,
        overlap,
        scale,
    };
    let (out_w, out_h) = geometry.output_size();
    let over_limit = rects.len() > config.tiling.max_tiles;

    if args.json {
        let plan = serde_json::json!({
            "width": width,
            "height": height,
            "tile_size": tile_size,
            "overlap": overlap,
            "scale": scale,
            "output_width": out_w,
            "output_height": out_h,
            "feather": geometry.feather(),
            "max_tiles": config.tiling.max_tiles,
            "tiles": rects,
        });
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!(
            "{width}x{height} -> {out_w}x{out_h}: {} tiles (tile {tile_size}, overlap {overlap}, feather {})",
            rects.len(),
            geometry.feather()
        );
        for (index, rect) in rects.iter().enumerate() {
            println!(
                "  #{index:<4} x={:<6} y={:<6} {}x{}",
                rect.x, rect.y, rect.width, rect.height
            );
        }
    }

    if over_limit {
        warn!(
            tiles = rects.len(),
            limit = config.tiling.max_tiles,
            "Plan exceeds the configured tile limit; upscale would be refused"
        );
    }
    Ok(())
}

fn load_rgba(path: &Path) -> Result<RgbaImage> {
    let decoded = image::open(path)
        .with_context(|| format!("Failed to decode image: {}", path.display()))?;
    Ok(decoded.to_rgba8())
}

fn save_image(image: &RgbaImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }

    let format = ImageFormat::from_path(path)
        .with_context(|| format!("Unsupported output format: {}", path.display()))?;
    let written = if format == ImageFormat::Jpeg {
        // JPEG has no alpha channel.
        DynamicImage::ImageRgba8(image.clone())
            .to_rgb8()
            .save_with_format(path, format)
    } else {
        image.save_with_format(path, format)
    };
    written.with_context(|| format!("Failed to write image: {}", path.display()))
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress(done: usize, total: usize, elapsed: f64) -> String {
    let fraction = if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let rate = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
    let eta = if rate > 0.0 && done < total {
        format!(" | ETA: {}", format_duration(total.saturating_sub(done) as f64 / rate))
    } else {
        String::new()
    };

    format!(
        "[{}] {:5.1}% | Tile {}/{} | {:.2} tiles/s | Elapsed: {}{}",
        bar,
        fraction * 100.0,
        done,
        total,
        rate,
        format_duration(elapsed),
        eta,
    )
}

fn make_progress_callback() -> ProgressCallback {
    let start = Instant::now();
    // Workers report concurrently; only move the bar forward.
    let high_water = Arc::new(Mutex::new(0usize));
    Arc::new(move |done, total| {
        let mut shown = high_water
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if done <= *shown {
            return;
        }
        *shown = done;
        eprint!(
            "\r{}    ",
            render_progress(done, total, start.elapsed().as_secs_f64())
        );
    })
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse cli")
    }

    fn upscale_args(args: &[&str]) -> UpscaleArgs {
        match parse(args).command {
            Commands::Upscale(upscale) => upscale,
            Commands::Plan(_) => panic!("expected upscale command"),
        }
    }

    fn plan_args(args: &[&str]) -> PlanArgs {
        match parse(args).command {
            Commands::Plan(plan) => plan,
            Commands::Upscale(_) => panic!("expected plan command"),
        }
    }

    #[test]
    fn plan_geometry_rejects_bad_scale() {
        let config = AppConfig::default();
        for scale in ["nan", "0", "9"] {
            let args = plan_args(&["seamless", "plan", "in.png", "--scale", scale]);
            let err = resolve_plan_geometry(&args.grid, &config).expect_err("bad scale");
            let upscale_error = err
                .downcast_ref::<seamless_core::UpscaleError>()
                .expect("typed error");
            assert_eq!(upscale_error.code(), "invalid_parameter", "scale {scale}");
        }

        let args = plan_args(&["seamless", "plan", "in.png", "--scale", "1.5", "--overlap", "16"]);
        let options = resolve_plan_geometry(&args.grid, &config).expect("valid plan");
        assert_eq!(options.upscale_factor, 1.5);
        assert_eq!(options.overlap, 16);
        assert_eq!(options.tile_size, config.tiling.tile_size);
    }

    #[test]
    fn upscale_defaults_follow_config() {
        let args = upscale_args(&["seamless", "upscale", "in.png", "-o", "out.png"]);
        let mut config = AppConfig::default();
        config.tiling.overlap = 32;
        config.output.default_scale = 3.0;

        let options = resolve_options(&args, &config);
        assert_eq!(options.tile_size, 256);
        assert_eq!(options.overlap, 32);
        assert_eq!(options.upscale_factor, 3.0);
        assert_eq!(options.enhancement_passes, 1);
        assert_eq!(options.contrast, 50.0);
    }

    #[test]
    fn explicit_flags_override_config() {
        let args = upscale_args(&[
            "seamless",
            "upscale",
            "in.png",
            "-o",
            "out.webp",
            "--scale",
            "4",
            "--tile-size",
            "128",
            "--overlap",
            "16",
            "--passes",
            "3",
            "--sharpness",
            "70",
            "--prompt",
            "crisp film still",
        ]);

        let options = resolve_options(&args, &AppConfig::default());
        assert_eq!(options.upscale_factor, 4.0);
        assert_eq!(options.tile_size, 128);
        assert_eq!(options.overlap, 16);
        assert_eq!(options.enhancement_passes, 3);
        assert_eq!(options.sharpness, 70.0);
        assert_eq!(options.prompt, "crisp film still");
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = parse(&[
            "seamless",
            "plan",
            "in.png",
            "-vv",
            "--log-filter",
            "seamless_core=trace",
            "--data-dir",
            "/tmp/seamless",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_filter.as_deref(), Some("seamless_core=trace"));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/seamless")));
    }

    #[test]
    fn endpoint_implies_http_backend() {
        let config = AppConfig::default();
        let local = upscale_args(&["seamless", "upscale", "a.png", "-o", "b.png"]);
        assert_eq!(resolve_backend(&local, &config), EnhancerBackend::Local);

        let http = upscale_args(&[
            "seamless",
            "upscale",
            "a.png",
            "-o",
            "b.png",
            "--endpoint",
            "http://127.0.0.1:9000/enhance",
        ]);
        assert_eq!(resolve_backend(&http, &config), EnhancerBackend::Http);

        let forced = upscale_args(&[
            "seamless",
            "upscale",
            "a.png",
            "-o",
            "b.png",
            "--endpoint",
            "http://127.0.0.1:9000/enhance",
            "--backend",
            "local",
        ]);
        assert_eq!(resolve_backend(&forced, &config), EnhancerBackend::Local);
    }

    #[test]
    fn http_backend_without_endpoint_is_an_error() {
        let args = upscale_args(&["seamless", "upscale", "a.png", "-o", "b.png", "--backend", "http"]);
        let error = build_enhancer(&args, &AppConfig::default())
            .err()
            .expect("missing endpoint must fail");
        assert!(error.to_string().contains("requires an endpoint"));
    }

    #[test]
    fn analysis_flags_build_context() {
        let args = upscale_args(&[
            "seamless",
            "upscale",
            "a.png",
            "-o",
            "b.png",
            "--describe",
            "portrait in soft light",
            "--texture",
            "skin",
            "--texture",
            "hair",
            "--subject",
            "woman",
        ]);
        assert_eq!(args.textures, vec!["skin", "hair"]);
        assert_eq!(args.subjects, vec!["woman"]);
        assert_eq!(args.describe.as_deref(), Some("portrait in soft light"));
    }

    #[test]
    fn missing_output_is_rejected() {
        assert!(Cli::try_parse_from(["seamless", "upscale", "in.png"]).is_err());
    }
}
