use std::error::Error as StdError;
use std::io::{self, Cursor, Read};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use image::{ImageFormat, RgbaImage};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use super::{EnhanceParams, TileEnhancer};
use crate::error::EnhanceError;
use crate::logging::redact_sensitive_text;

pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

const CONNECT_TIMEOUT_CAP: Duration = Duration::from_secs(15);
const MAX_RETRIES_CAP: u32 = 5;

#[derive(Debug, Clone)]
pub struct HttpEnhancerOptions {
    pub endpoint: Url,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_response_bytes: usize,
}

impl HttpEnhancerOptions {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            api_key: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

/// Sends each buffer to a remote enhancement service as PNG and expects an
/// encoded image back.
///
/// Request: `POST <endpoint>?prompt=..&scale=..&position=..&pass=..&textures=..&subjects=..`
/// with an `image/png` body. Transport errors, timeouts, 429 and 5xx are
/// retried with linear backoff.
#[derive(Debug, Clone)]
pub struct HttpEnhancer {
    options: HttpEnhancerOptions,
}

impl HttpEnhancer {
    pub fn new(options: HttpEnhancerOptions) -> Result<Self> {
        match options.endpoint.scheme() {
            "http" | "https" => {}
            scheme => bail!(
                "unsupported enhancer endpoint scheme '{scheme}' for '{}' (expected http/https)",
                redacted_url_for_display(&options.endpoint)
            ),
        }
        let mut options = options;
        options.max_retries = options.max_retries.min(MAX_RETRIES_CAP);
        options.max_response_bytes = options.max_response_bytes.max(1);
        Ok(Self { options })
    }

    fn request_url(&self, params: &EnhanceParams<'_>) -> Url {
        let mut url = self.options.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("prompt", params.prompt);
            query.append_pair("scale", &params.scale.to_string());
            if let Some(context) = params.context {
                query.append_pair("position", context.position.label());
                query.append_pair("pass", &context.pass.to_string());
                if !context.textures.is_empty() {
                    query.append_pair("textures", &context.textures.join(","));
                }
                if !context.subjects.is_empty() {
                    query.append_pair("subjects", &context.subjects.join(","));
                }
            }
        }
        url
    }

    fn build_client(&self) -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .connect_timeout(self.options.timeout.min(CONNECT_TIMEOUT_CAP))
            .timeout(self.options.timeout)
            .build()
            .context("failed to build HTTP client for enhancer")
    }

    fn execute_once(
        &self,
        client: &reqwest::blocking::Client,
        url: &Url,
        body: &[u8],
    ) -> std::result::Result<RgbaImage, AttemptError> {
        let display_url = redacted_url_for_display(url);

        let mut request = client
            .post(url.as_str())
            .header(CONTENT_TYPE, "image/png")
            .body(body.to_vec());
        if let Some(api_key) = self.options.api_key.as_deref() {
            request = request.bearer_auth(api_key);
        }

        let mut response = request.send().map_err(|err| {
            let wrapped = anyhow!(
                "enhancer transport error for {display_url}: {}",
                redact_sensitive_text(&err.to_string())
            );
            AttemptError::from_reqwest(&err, wrapped)
        })?;

        let status = response.status();
        if !status.is_success() {
            let snippet = read_body_limited(&mut response, 512)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
            let error = anyhow!(
                "enhancer returned HTTP {} for {display_url}: {}",
                status.as_u16(),
                redact_sensitive_text(snippet.trim())
            );
            return Err(if is_retryable_status(status) {
                AttemptError::retryable(error)
            } else {
                AttemptError::fatal(error)
            });
        }

        let bytes = read_body_limited(&mut response, self.options.max_response_bytes).map_err(
            |err| {
                let wrapped = anyhow!(
                    "reading enhancer body for {display_url}: {}",
                    redact_sensitive_text(&err.to_string())
                );
                match &err {
                    BodyError::Read(io) if is_timeout_error(io) => AttemptError::timed_out(wrapped),
                    BodyError::Read(_) => AttemptError::retryable(wrapped),
                    BodyError::TooLarge { .. } => AttemptError::fatal(wrapped),
                }
            },
        )?;

        image::load_from_memory(&bytes)
            .map(|decoded| decoded.to_rgba8())
            .map_err(|err| {
                AttemptError::fatal(anyhow!(
                    "enhancer response from {display_url} is not a decodable image: {err}"
                ))
            })
    }
}

impl TileEnhancer for HttpEnhancer {
    fn name(&self) -> &str {
        "HttpEnhancer"
    }

    fn is_ai(&self) -> bool {
        true
    }

    fn enhance(
        &self,
        pixels: &RgbaImage,
        params: &EnhanceParams<'_>,
    ) -> std::result::Result<RgbaImage, EnhanceError> {
        let mut body = Vec::new();
        pixels
            .write_to(&mut Cursor::new(&mut body), ImageFormat::Png)
            .context("failed to encode tile as PNG")?;

        let client = self.build_client()?;
        let url = self.request_url(params);
        let max_attempts = self.options.max_retries as usize + 1;
        let started = Instant::now();

        for attempt in 1..=max_attempts {
            match self.execute_once(&client, &url, &body) {
                Ok(image) => {
                    debug!(
                        attempt,
                        width = image.width(),
                        height = image.height(),
                        "Remote enhancement succeeded"
                    );
                    return Ok(image);
                }
                Err(attempt_error) => {
                    if attempt_error.retryable && attempt < max_attempts {
                        let delay = self.options.retry_backoff.saturating_mul(attempt as u32);
                        warn!(
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %attempt_error.error,
                            "Remote enhancement attempt failed; retrying"
                        );
                        std::thread::sleep(delay);
                        continue;
                    }

                    if attempt_error.timed_out {
                        return Err(EnhanceError::TimedOut {
                            elapsed: started.elapsed(),
                            message: format!("{:#}", attempt_error.error),
                        });
                    }
                    if attempt_error.retryable {
                        return Err(EnhanceError::Failed(anyhow!(
                            "enhancer failed after {max_attempts} attempts: {:#}",
                            attempt_error.error
                        )));
                    }
                    return Err(EnhanceError::Failed(attempt_error.error));
                }
            }
        }

        Err(EnhanceError::failed(format!(
            "enhancer failed after {max_attempts} attempts"
        )))
    }
}

struct AttemptError {
    retryable: bool,
    timed_out: bool,
    error: anyhow::Error,
}

impl AttemptError {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            timed_out: false,
            error,
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            timed_out: false,
            error,
        }
    }

    fn timed_out(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            timed_out: true,
            error,
        }
    }

    fn from_reqwest(err: &reqwest::Error, error: anyhow::Error) -> Self {
        let timed_out = is_timeout_error(err);
        Self {
            retryable: timed_out || err.is_connect() || err.is_request() || err.is_body(),
            timed_out,
            error,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum BodyError {
    #[error("failed to read HTTP response body: {0}")]
    Read(#[source] io::Error),
    #[error("response body exceeded {limit} bytes")]
    TooLarge { limit: usize },
}

/// Walks the source chain looking for a deadline overrun. The blocking
/// reader surfaces those as an `io::Error` wrapping a `reqwest::Error`, and
/// `io::Error::source` skips the wrapped error, so `get_ref` is followed too.
fn is_timeout_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(error) = current {
        if let Some(io_error) = error.downcast_ref::<io::Error>() {
            if io_error.kind() == io::ErrorKind::TimedOut {
                return true;
            }
            if let Some(inner) = io_error.get_ref() {
                if is_timeout_error(inner) {
                    return true;
                }
            }
        }
        if let Some(reqwest_error) = error.downcast_ref::<reqwest::Error>() {
            if reqwest_error.is_timeout() {
                return true;
            }
        }
        current = error.source();
    }
    false
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn read_body_limited(
    response: &mut reqwest::blocking::Response,
    max_bytes: usize,
) -> std::result::Result<Vec<u8>, BodyError> {
    let mut bytes = Vec::with_capacity(max_bytes.min(64 * 1024));
    let mut buffer = [0u8; 8192];

    loop {
        let read_count = response.read(&mut buffer).map_err(BodyError::Read)?;
        if read_count == 0 {
            break;
        }

        if bytes.len().saturating_add(read_count) > max_bytes {
            return Err(BodyError::TooLarge { limit: max_bytes });
        }

        bytes.extend_from_slice(&buffer[..read_count]);
    }

    Ok(bytes)
}

fn redacted_url_for_display(url: &Url) -> String {
    let mut display = url.clone();
    let _ = display.set_password(None);
    if !display.username().is_empty() {
        let _ = display.set_username("");
    }
    if display.query().is_some() {
        display.set_query(None);
        return format!("{display}?<redacted>");
    }
    display.to_string()
}
