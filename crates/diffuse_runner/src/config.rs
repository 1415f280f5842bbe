//! Launch configuration for the backend process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// How the backend script is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Launch script (e.g. `webui.sh`). `None` means not configured.
    pub executable: Option<PathBuf>,
    /// Arguments passed to the script
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Working directory (defaults to the script's parent directory)
    pub workdir: Option<PathBuf>,
    /// How long to wait for the output readers after exit, in milliseconds
    pub drain_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on terminate, in milliseconds
    pub stop_timeout_ms: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        let mut env = HashMap::new();
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        Self {
            executable: None,
            args: Vec::new(),
            env,
            workdir: None,
            drain_timeout_ms: 2_000,
            stop_timeout_ms: 10_000,
        }
    }
}

impl LaunchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn stop_timeout_ms(mut self, ms: u64) -> Self {
        self.stop_timeout_ms = ms;
        self
    }

    /// Directory the process runs in: the explicit workdir, else the
    /// script's parent directory.
    pub fn working_dir_for(&self, executable: &Path) -> Option<PathBuf> {
        self.workdir.clone().or_else(|| {
            executable
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
    }
}
