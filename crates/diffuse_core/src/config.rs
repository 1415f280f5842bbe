//! Supervisor configuration.
//!
//! Loaded from a TOML file (default `diffuse.toml`), then overridden by
//! `DIFFUSE_*` environment variables. A missing file means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use diffuse_runner::LaunchConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "diffuse.toml";

/// Subdirectory of `output_dir` that receives txt2img results.
pub const TXT2IMG_DIR: &str = "txt2img";

/// Everything the coordinator needs to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Backend launch script. `None` means not configured.
    pub executable: Option<PathBuf>,
    pub launch_args: Vec<String>,
    /// Used until the backend prints its own URL
    pub base_url: String,
    pub output_dir: PathBuf,
    pub models_dir: Option<PathBuf>,
    pub selected_model: Option<String>,
    pub request_timeout_secs: f64,
    pub model_load_expiry_secs: f64,
    pub generation_expiry_secs: f64,
    /// 0 disables progress polling
    pub progress_poll_ms: u64,
    /// Refuse to generate while a model is loading or after it failed
    pub block_generation_on_load_failure: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            executable: None,
            launch_args: vec!["--api".to_string()],
            base_url: "http://127.0.0.1:7860".to_string(),
            output_dir: PathBuf::from("outputs"),
            models_dir: None,
            selected_model: None,
            request_timeout_secs: 1000.0,
            model_load_expiry_secs: 5.0,
            generation_expiry_secs: 3.0,
            progress_poll_ms: 1000,
            block_generation_on_load_failure: false,
        }
    }
}

impl SupervisorConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` (or `diffuse.toml` in the current directory) and
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

        let mut config = if path.exists() {
            debug!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(&path)?;
            Self::from_toml_str(&content)
                .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            debug!("No configuration at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `DIFFUSE_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DIFFUSE_EXECUTABLE") {
            self.executable = Some(PathBuf::from(v));
        }
        if let Some(v) = get("DIFFUSE_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = get("DIFFUSE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = get("DIFFUSE_MODELS_DIR") {
            self.models_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("DIFFUSE_MODEL") {
            self.selected_model = Some(v);
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        let delays = [
            ("request_timeout_secs", self.request_timeout_secs),
            ("model_load_expiry_secs", self.model_load_expiry_secs),
            ("generation_expiry_secs", self.generation_expiry_secs),
        ];
        for (name, value) in delays {
            if !value.is_finite() || value <= 0.0 {
                return Err(CoreError::Config(format!(
                    "{} must be a positive number of seconds, got {}",
                    name, value
                )));
            }
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(CoreError::Config(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        Ok(())
    }

    /// Launch settings for the process supervisor.
    pub fn launch_config(&self) -> LaunchConfig {
        let config = LaunchConfig::new().args(self.launch_args.clone());
        match &self.executable {
            Some(path) => config.executable(path.clone()),
            None => config,
        }
    }

    /// Directory handed to the image writer.
    pub fn generation_output_dir(&self) -> PathBuf {
        self.output_dir.join(TXT2IMG_DIR)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }

    pub fn model_load_expiry(&self) -> Duration {
        Duration::from_secs_f64(self.model_load_expiry_secs)
    }

    pub fn generation_expiry(&self) -> Duration {
        Duration::from_secs_f64(self.generation_expiry_secs)
    }

    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_poll_ms > 0).then(|| Duration::from_millis(self.progress_poll_ms))
    }
}
