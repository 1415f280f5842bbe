//! Generation requests and the txt2img wire format.

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Seed value asking the backend to pick a random seed.
pub const RANDOM_SEED: i64 = -1;

/// Prompt parameters for one txt2img call.
///
/// Numeric fields are held as `f64` because they come from sliders and
/// text fields; [`Txt2ImgPayload`] converts them to integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub width: f64,
    pub height: f64,
    pub cfg_scale: f64,
    pub sampling_steps: f64,
    /// `-1` requests a random seed
    pub seed: i64,
    pub batch_count: f64,
    pub batch_size: f64,
    pub clip_skip: f64,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            positive_prompt: String::new(),
            negative_prompt: String::new(),
            width: 512.0,
            height: 512.0,
            cfg_scale: 7.0,
            sampling_steps: 20.0,
            seed: RANDOM_SEED,
            batch_count: 1.0,
            batch_size: 1.0,
            clip_skip: 1.0,
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            positive_prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn negative(mut self, prompt: impl Into<String>) -> Self {
        self.negative_prompt = prompt.into();
        self
    }

    pub fn size(mut self, width: f64, height: f64) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn cfg_scale(mut self, scale: f64) -> Self {
        self.cfg_scale = scale;
        self
    }

    pub fn steps(mut self, steps: f64) -> Self {
        self.sampling_steps = steps;
        self
    }

    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    /// Seed typed as text. Anything that is not an integer means random.
    pub fn seed_text(mut self, text: &str) -> Self {
        self.seed = text.trim().parse().unwrap_or(RANDOM_SEED);
        self
    }

    pub fn batch(mut self, count: f64, size: f64) -> Self {
        self.batch_count = count;
        self.batch_size = size;
        self
    }

    pub fn clip_skip(mut self, layers: f64) -> Self {
        self.clip_skip = layers;
        self
    }

    /// Check the fields the backend requires to be positive.
    pub fn validate(&self) -> ApiResult<()> {
        let positive = [
            ("width", self.width),
            ("height", self.height),
            ("sampling steps", self.sampling_steps),
            ("batch count", self.batch_count),
            ("batch size", self.batch_size),
        ];

        for (name, value) in positive {
            if !value.is_finite() || value < 1.0 {
                return Err(ApiError::InvalidRequest(format!(
                    "{} must be a positive integer, got {}",
                    name, value
                )));
            }
        }

        if !self.cfg_scale.is_finite() || !self.clip_skip.is_finite() {
            return Err(ApiError::InvalidRequest(
                "cfg scale and clip skip must be finite".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the JSON body for `POST /sdapi/v1/txt2img`.
    pub fn to_payload(&self) -> Txt2ImgPayload {
        Txt2ImgPayload::from(self)
    }
}

/// `override_settings` of a txt2img body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideSettings {
    #[serde(rename = "CLIP_stop_at_last_layers")]
    pub clip_stop_at_last_layers: i64,
}

/// Request body of `POST /sdapi/v1/txt2img`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Txt2ImgPayload {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: i64,
    pub height: i64,
    pub cfg_scale: i64,
    pub steps: i64,
    pub seed: i64,
    pub batch_count: i64,
    pub batch_size: i64,
    pub override_settings: OverrideSettings,
    pub do_not_save_grid: bool,
    pub do_not_save_samples: bool,
}

impl From<&GenerationRequest> for Txt2ImgPayload {
    fn from(request: &GenerationRequest) -> Self {
        // Fractional parts are dropped, as integer slider values are expected.
        Self {
            prompt: request.positive_prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            width: request.width as i64,
            height: request.height as i64,
            cfg_scale: request.cfg_scale as i64,
            steps: request.sampling_steps as i64,
            seed: request.seed,
            batch_count: request.batch_count as i64,
            batch_size: request.batch_size as i64,
            override_settings: OverrideSettings {
                clip_stop_at_last_layers: request.clip_skip as i64,
            },
            do_not_save_grid: false,
            do_not_save_samples: false,
        }
    }
}

/// Response body of `POST /sdapi/v1/txt2img`.
#[derive(Debug, Clone, Deserialize)]
pub struct Txt2ImgResponse {
    #[serde(default)]
    pub images: Option<Vec<String>>,
}

/// Response body of `GET /sdapi/v1/progress` (only the field we use).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressResponse {
    pub progress: f64,
}

/// Body of `POST /sdapi/v1/options` when switching checkpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointOptions<'a> {
    pub sd_model_checkpoint: &'a str,
}
