//! Error types for the runner module.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur while supervising the backend process.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("Backend is already running")]
    AlreadyRunning,

    #[error("Invalid log pattern '{name}': {message}")]
    InvalidPattern { name: &'static str, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a launch request is rejected before or while spawning.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("executable path is empty")]
    EmptyPath,

    #[error("executable not found: {0}")]
    NotFound(PathBuf),

    #[error("not an executable file: {0}")]
    NotExecutable(PathBuf),

    #[error("failed to spawn {path}: {message}")]
    Spawn { path: PathBuf, message: String },
}
