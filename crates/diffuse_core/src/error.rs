//! Error types for the core module.

use diffuse_api::ApiError;
use diffuse_runner::RunnerError;
use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur during core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Supervisor error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Model catalog error: {0}")]
    Catalog(String),

    #[error("Coordinator is not running")]
    CoordinatorStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a generation request did not produce images.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("cannot generate: {0}")]
    Precondition(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("backend returned no images")]
    EmptyResult,

    #[error("backend process was terminated")]
    ProcessTerminated,

    #[error("coordinator is not running")]
    CoordinatorStopped,
}

impl GenerationError {
    /// Short machine-friendly name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "precondition",
            Self::Timeout => "timeout",
            Self::Network(_) => "network",
            Self::Decode(_) => "decode",
            Self::EmptyResult => "empty-result",
            Self::ProcessTerminated => "process-terminated",
            Self::CoordinatorStopped => "coordinator-stopped",
        }
    }
}

impl From<ApiError> for GenerationError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Timeout => Self::Timeout,
            ApiError::Network(m) | ApiError::InvalidUrl(m) => Self::Network(m),
            ApiError::Status { status, body } => {
                Self::Network(format!("backend returned HTTP {}: {}", status, body))
            }
            ApiError::Decode(m) => Self::Decode(m),
            ApiError::EmptyResult => Self::EmptyResult,
            ApiError::InvalidRequest(m) => Self::Precondition(m),
        }
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}
