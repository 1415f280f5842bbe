//! HTTP access to the generation backend.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};
use crate::payload::{CheckpointOptions, ProgressResponse, Txt2ImgPayload, Txt2ImgResponse};

/// Connect and read timeout of the generation call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1000);

const PROGRESS_TIMEOUT: Duration = Duration::from_secs(5);

pub const TXT2IMG_PATH: &str = "sdapi/v1/txt2img";
pub const PROGRESS_PATH: &str = "sdapi/v1/progress";
pub const OPTIONS_PATH: &str = "sdapi/v1/options";

/// The backend operations the supervisor needs.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Run one txt2img request and return the base64 images.
    async fn txt2img(&self, base_url: &str, payload: &Txt2ImgPayload) -> ApiResult<Vec<String>>;

    /// Current progress of the running job, in `0.0..=1.0`.
    async fn progress(&self, base_url: &str) -> ApiResult<f64>;

    /// Ask the backend to switch to another checkpoint.
    async fn set_checkpoint(&self, base_url: &str, checkpoint: &str) -> ApiResult<()>;
}

/// Join a base URL and an API path.
pub fn endpoint(base_url: &str, path: &str) -> ApiResult<String> {
    let base = base_url.trim().trim_end_matches('/');
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(ApiError::InvalidUrl(base_url.to_string()));
    }
    Ok(format!("{}/{}", base, path.trim_start_matches('/')))
}

/// reqwest-backed client for an A1111-compatible API.
#[derive(Debug, Clone)]
pub struct WebUiClient {
    client: reqwest::Client,
}

impl WebUiClient {
    /// Create a client whose connect and overall timeouts are `timeout`.
    pub fn new(timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    async fn check_status(response: reqwest::Response) -> ApiResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl GenerationBackend for WebUiClient {
    async fn txt2img(&self, base_url: &str, payload: &Txt2ImgPayload) -> ApiResult<Vec<String>> {
        let url = endpoint(base_url, TXT2IMG_PATH)?;
        debug!("POST {} ({}x{}, {} steps)", url, payload.width, payload.height, payload.steps);

        let response = self.client.post(&url).json(payload).send().await?;
        let response = Self::check_status(response).await?;

        let body = response.text().await?;
        let decoded: Txt2ImgResponse = serde_json::from_str(&body)?;

        match decoded.images {
            Some(images) if !images.is_empty() => {
                debug!("txt2img returned {} image(s)", images.len());
                Ok(images)
            }
            Some(_) => Err(ApiError::EmptyResult),
            None => Err(ApiError::Decode("missing \"images\" array".to_string())),
        }
    }

    async fn progress(&self, base_url: &str) -> ApiResult<f64> {
        let url = endpoint(base_url, PROGRESS_PATH)?;
        let response = self
            .client
            .get(&url)
            .query(&[("skip_current_image", "true")])
            .timeout(PROGRESS_TIMEOUT)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let decoded: ProgressResponse = serde_json::from_str(&response.text().await?)?;

        Ok(decoded.progress.clamp(0.0, 1.0))
    }

    async fn set_checkpoint(&self, base_url: &str, checkpoint: &str) -> ApiResult<()> {
        let url = endpoint(base_url, OPTIONS_PATH)?;
        debug!("Switching checkpoint to {}", checkpoint);

        let response = self
            .client
            .post(&url)
            .json(&CheckpointOptions {
                sd_model_checkpoint: checkpoint,
            })
            .send()
            .await?;

        if let Err(e) = Self::check_status(response).await {
            warn!("Checkpoint switch to {} failed: {}", checkpoint, e);
            return Err(e);
        }
        Ok(())
    }
}
