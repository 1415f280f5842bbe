//! CLI command definitions.
//!
//! Each subcommand maps to one way of driving the backend supervisor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use diffuse_api::WebUiClient;
use diffuse_core::{Coordinator, CoordinatorHandle, SupervisorConfig, SupervisorSnapshot};
use diffuse_store::DiskImageWriter;

pub mod generate;
pub mod models;
pub mod parse_log;
pub mod run;

/// diffuse - supervisor for a local image generation backend
#[derive(Parser)]
#[command(name = "diffuse")]
#[command(version, about = "diffuse - supervisor for a local image generation backend")]
#[command(long_about = r#"
diffuse launches an AUTOMATIC1111-style webui.sh, follows its output to track
model loading, and drives txt2img generations against its HTTP API.

COMMANDS:
  run        → Launch the backend and follow its state until Ctrl-C
  generate   → Launch the backend, generate once, save the images
  parse-log  → Show the events found in a captured backend log
  models     → List checkpoints in the models directory

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments or configuration
  3 - Backend launch failure
  4 - Generation failure
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Configuration file (defaults to ./diffuse.toml)
    #[arg(short, long, global = true, env = "DIFFUSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON (and log as JSON)
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch the backend and report state changes until interrupted
    Run(run::RunArgs),

    /// Launch the backend and run a single generation
    Generate(generate::GenerateArgs),

    /// Parse a captured backend log offline
    #[command(name = "parse-log")]
    ParseLog(parse_log::ParseLogArgs),

    /// List available checkpoints
    Models(models::ModelsArgs),
}

/// Load the configuration and apply command-line overrides.
pub fn load_config(
    global: &GlobalArgs,
    executable: Option<PathBuf>,
    model: Option<String>,
) -> Result<SupervisorConfig> {
    let mut config = SupervisorConfig::load(global.config.as_deref())
        .context("Failed to load configuration")?;
    if executable.is_some() {
        config.executable = executable;
    }
    if model.is_some() {
        config.selected_model = model;
    }
    Ok(config)
}

/// Spawn the coordinator against the real HTTP backend and disk writer.
pub fn spawn_coordinator(config: SupervisorConfig) -> Result<CoordinatorHandle> {
    let client = WebUiClient::new(config.request_timeout()).context("Failed to build HTTP client")?;
    let handle = Coordinator::spawn(config, Arc::new(client), Arc::new(DiskImageWriter::new()))?;
    Ok(handle)
}

/// Wait until the backend serves HTTP. Fails if the process goes away first.
pub async fn wait_until_serving(
    handle: &CoordinatorHandle,
    timeout: Duration,
) -> Result<SupervisorSnapshot> {
    let snapshot = handle
        .wait_for(timeout, |s| s.service_url.is_some() || !s.process.has_process())
        .await
        .with_context(|| format!("Backend was not ready after {}s", timeout.as_secs()))?;

    if snapshot.service_url.is_none() {
        anyhow::bail!(
            "Backend stopped before serving: {}",
            snapshot.last_error.as_deref().unwrap_or("no output")
        );
    }
    Ok(snapshot)
}

/// Print a value as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}
