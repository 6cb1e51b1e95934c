use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by an enhancement capability for a single buffer.
#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error("enhancement timed out after {elapsed:?}: {message}")]
    TimedOut { elapsed: Duration, message: String },
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl EnhanceError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(anyhow::anyhow!(message.into()))
    }
}

/// Errors surfaced by the reconstruction pipeline.
#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("decomposition would produce {tiles} tiles (limit {limit})")]
    TileLimitExceeded { tiles: usize, limit: usize },

    #[error("enhancement failed for tile {index} at ({x}, {y}): {source:#}")]
    EnhancementFailed {
        index: usize,
        x: u32,
        y: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("enhancement timed out for tile {index} at ({x}, {y}) after {elapsed:?}: {message}")]
    TimedOut {
        index: usize,
        x: u32,
        y: u32,
        elapsed: Duration,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl UpscaleError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::InvalidImage(_) => "invalid_image",
            Self::TileLimitExceeded { .. } => "tile_limit_exceeded",
            Self::EnhancementFailed { .. } => "enhancement_failed",
            Self::TimedOut { .. } => "timed_out",
            Self::Internal(_) => "internal",
        }
    }

    /// Attach tile identity to a capability failure.
    pub fn from_enhance(index: usize, x: u32, y: u32, error: EnhanceError) -> Self {
        match error {
            EnhanceError::TimedOut { elapsed, message } => Self::TimedOut {
                index,
                x,
                y,
                elapsed,
                message,
            },
            EnhanceError::Failed(source) => Self::EnhancementFailed {
                index,
                x,
                y,
                source,
            },
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Caller-facing structured error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

pub type UpscaleResult<T> = std::result::Result<T, UpscaleError>;
