//! Core crate for seamless tile-based upscaling.

pub mod config;
pub mod enhancer;
pub mod error;
pub mod logging;
pub mod merge;
pub mod pipeline;
pub mod postprocess;
pub mod refine;
pub mod scheduler;
pub mod tiling;
pub mod types;

pub use error::{ErrorBody, UpscaleError, UpscaleResult};
pub use pipeline::{Pipeline, PipelineSettings, UpscaleOptions, UpscaleRequest, UpscaleResponse};
