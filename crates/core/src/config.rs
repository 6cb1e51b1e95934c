use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::enhancer::{
    HttpEnhancerOptions, DEFAULT_MAX_RESPONSE_BYTES, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_BACKOFF_MS, DEFAULT_SHARPEN_STRENGTH, DEFAULT_TIMEOUT_MS,
};
use crate::scheduler::DEFAULT_CONCURRENCY;
use crate::tiling::{DEFAULT_MAX_TILES, DEFAULT_TILE_OVERLAP, DEFAULT_TILE_SIZE};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "SEAMLESS_DATA_DIR";
pub const DEFAULT_SCALE: f64 = 2.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub tiling: TilingConfig,
    pub scheduler: SchedulerConfig,
    pub enhancer: EnhancerConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TilingConfig {
    pub tile_size: u32,
    pub overlap: u32,
    pub max_tiles: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnhancerBackend {
    #[default]
    Local,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnhancerConfig {
    pub backend: EnhancerBackend,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_response_bytes: usize,
    pub sharpen_strength: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub default_scale: f64,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_TILE_OVERLAP,
            max_tiles: DEFAULT_MAX_TILES,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self {
            backend: EnhancerBackend::Local,
            endpoint: None,
            api_key: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            sharpen_strength: DEFAULT_SHARPEN_STRENGTH,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            default_scale: DEFAULT_SCALE,
        }
    }
}

impl EnhancerConfig {
    /// Options for the HTTP backend. Fails when no endpoint is configured.
    pub fn http_options(&self) -> Result<HttpEnhancerOptions> {
        let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.trim().is_empty()) else {
            bail!("enhancer backend \"http\" requires an endpoint");
        };
        let endpoint = url::Url::parse(endpoint.trim())
            .with_context(|| format!("invalid enhancer endpoint: {endpoint}"))?;

        let mut options = HttpEnhancerOptions::new(endpoint);
        options.api_key = self.api_key.clone().filter(|key| !key.is_empty());
        options.timeout = Duration::from_millis(self.timeout_ms.max(1));
        options.max_retries = self.max_retries;
        options.retry_backoff = Duration::from_millis(self.retry_backoff_ms);
        options.max_response_bytes = self.max_response_bytes.max(1);
        Ok(options)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory:
/// 1. CLI override if provided
/// 2. SEAMLESS_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml when none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}
