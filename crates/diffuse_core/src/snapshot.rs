//! Published read-only view of the supervisor state.

use std::path::PathBuf;

use diffuse_runner::ProcessLifecycleState;
use diffuse_store::SavedImages;
use serde::Serialize;

use crate::generation::GenerationPhase;
use crate::model_load::ModelLoadPhase;

/// Outcome of a successful generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    /// Base64 image payloads, in backend order
    #[serde(skip)]
    pub images: Vec<String>,
    #[serde(skip)]
    pub primary_image: Option<Vec<u8>>,
    pub image_count: usize,
    pub primary_path: Option<String>,
    pub saved_paths: Vec<PathBuf>,
    /// Set when the images could not be written
    pub persistence_error: Option<String>,
}

impl GenerationResult {
    pub fn new(images: Vec<String>) -> Self {
        Self {
            image_count: images.len(),
            images,
            ..Self::default()
        }
    }

    pub fn with_saved(mut self, saved: SavedImages) -> Self {
        self.primary_image = saved.primary_image;
        self.primary_path = (!saved.primary_path.is_empty()).then_some(saved.primary_path);
        self.saved_paths = saved.saved_paths;
        self
    }

    pub fn with_persistence_error(mut self, error: impl Into<String>) -> Self {
        self.persistence_error = Some(error.into());
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.persistence_error.is_none() && !self.saved_paths.is_empty()
    }
}

/// Everything observers may read. Published after every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSnapshot {
    pub process: ProcessLifecycleState,
    pub crashed: bool,
    pub exit_code: Option<i32>,
    pub service_url: Option<String>,
    pub model_load: ModelLoadPhase,
    pub model_load_elapsed_secs: f64,
    pub generation: GenerationPhase,
    pub generation_allowed: bool,
    pub selected_model: Option<String>,
    pub last_result: Option<GenerationResult>,
    pub last_error: Option<String>,
}

impl Default for SupervisorSnapshot {
    fn default() -> Self {
        Self {
            process: ProcessLifecycleState::NotConfigured,
            crashed: false,
            exit_code: None,
            service_url: None,
            model_load: ModelLoadPhase::Idle,
            model_load_elapsed_secs: 0.0,
            generation: GenerationPhase::Idle,
            generation_allowed: false,
            selected_model: None,
            last_result: None,
            last_error: None,
        }
    }
}

impl SupervisorSnapshot {
    /// Single-line summary for logs and the CLI status line.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "process={} model={} generation={}",
            self.process, self.model_load, self.generation
        );
        if self.model_load == ModelLoadPhase::Done {
            line.push_str(&format!(" loaded_in={:.1}s", self.model_load_elapsed_secs));
        }
        if let Some(url) = &self.service_url {
            line.push_str(&format!(" url={}", url));
        }
        line
    }
}
