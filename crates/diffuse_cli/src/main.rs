//! diffuse CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments or configuration
//! - 3: Backend launch failure
//! - 4: Generation failure

use std::process::ExitCode;

use clap::Parser;
use diffuse_api::ApiError;
use diffuse_core::{CoreError, GenerationError};
use diffuse_runner::RunnerError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const LAUNCH_FAILURE: u8 = 3;
    pub const GENERATION_FAILURE: u8 = 4;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if init_logging(cli.global.verbose, cli.global.json).is_err() {
        // Logging already initialized, continue
    }

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(&cli.global, args).await,
        Commands::Generate(args) => commands::generate::execute(&cli.global, args).await,
        Commands::ParseLog(args) => commands::parse_log::execute(&cli.global, args).await,
        Commands::Models(args) => commands::models::execute(&cli.global, args).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

fn init_logging(verbose: bool, json: bool) -> Result<(), tracing_subscriber::util::TryInitError> {
    let default = if verbose { "diffuse=debug,warn" } else { "diffuse=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry().with(layer).with(filter).try_init()
}

/// Pick the exit code from the first typed error in the chain.
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(core) = cause.downcast_ref::<CoreError>() {
            return match core {
                CoreError::Config(_) | CoreError::Catalog(_) => ExitCodes::INVALID_ARGS,
                CoreError::Runner(_) => ExitCodes::LAUNCH_FAILURE,
                CoreError::Generation(_) => ExitCodes::GENERATION_FAILURE,
                _ => ExitCodes::GENERAL_ERROR,
            };
        }
        if cause.downcast_ref::<RunnerError>().is_some() {
            return ExitCodes::LAUNCH_FAILURE;
        }
        if cause.downcast_ref::<GenerationError>().is_some() {
            return ExitCodes::GENERATION_FAILURE;
        }
        if let Some(ApiError::InvalidRequest(_)) = cause.downcast_ref::<ApiError>() {
            return ExitCodes::INVALID_ARGS;
        }
    }
    ExitCodes::GENERAL_ERROR
}
