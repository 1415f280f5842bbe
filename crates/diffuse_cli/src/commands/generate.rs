//! Generate command - Launch the backend and run one txt2img request.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use diffuse_api::{parse_infotext, GenerationRequest};
use diffuse_core::GenerationResult;

use super::{load_config, print_json, spawn_coordinator, wait_until_serving, GlobalArgs};

#[derive(Args)]
pub struct GenerateArgs {
    /// Positive prompt
    prompt: Option<String>,

    /// Read prompt and parameters from a generation-data text file
    #[arg(long)]
    infotext: Option<PathBuf>,

    /// Negative prompt
    #[arg(short, long)]
    negative: Option<String>,

    #[arg(long)]
    width: Option<f64>,

    #[arg(long)]
    height: Option<f64>,

    #[arg(long)]
    steps: Option<f64>,

    #[arg(long)]
    cfg_scale: Option<f64>,

    /// Seed; anything that is not an integer means random
    #[arg(short, long)]
    seed: Option<String>,

    #[arg(long)]
    batch_count: Option<f64>,

    #[arg(long)]
    batch_size: Option<f64>,

    #[arg(long)]
    clip_skip: Option<f64>,

    /// Backend launch script (overrides the configuration)
    #[arg(short, long)]
    executable: Option<PathBuf>,

    /// Checkpoint to treat as selected
    #[arg(short, long)]
    model: Option<String>,

    /// Seconds to wait for the backend to serve HTTP
    #[arg(long, default_value_t = 600)]
    ready_timeout: u64,
}

pub async fn execute(global: &GlobalArgs, args: GenerateArgs) -> Result<()> {
    let request = build_request(&args)?;
    request.validate().context("Invalid generation parameters")?;

    let config = load_config(global, args.executable.clone(), args.model.clone())?;
    let handle = spawn_coordinator(config)?;

    let outcome = generate(&handle, request, Duration::from_secs(args.ready_timeout)).await;
    handle.shutdown().await?;
    let result = outcome?;

    if global.json {
        print_json(&result)?;
    } else {
        print_result(&result);
    }
    Ok(())
}

async fn generate(
    handle: &diffuse_core::CoordinatorHandle,
    request: GenerationRequest,
    ready_timeout: Duration,
) -> Result<GenerationResult> {
    handle.start(None).await?;
    let ready = wait_until_serving(handle, ready_timeout).await?;
    info!("Backend ready: {}", ready.summary());

    info!("Generating: {}", request.positive_prompt);
    let result = handle.submit(request).await?;
    Ok(result)
}

fn build_request(args: &GenerateArgs) -> Result<GenerationRequest> {
    let mut request = match &args.infotext {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            parse_infotext(&text)
        }
        None => GenerationRequest::default(),
    };

    if let Some(prompt) = &args.prompt {
        request.positive_prompt = prompt.clone();
    }
    if request.positive_prompt.trim().is_empty() {
        anyhow::bail!("A prompt argument or --infotext file is required");
    }
    if let Some(negative) = &args.negative {
        request.negative_prompt = negative.clone();
    }
    if let Some(width) = args.width {
        request.width = width;
    }
    if let Some(height) = args.height {
        request.height = height;
    }
    if let Some(steps) = args.steps {
        request.sampling_steps = steps;
    }
    if let Some(scale) = args.cfg_scale {
        request.cfg_scale = scale;
    }
    if let Some(seed) = &args.seed {
        request = request.seed_text(seed);
    }
    if let Some(count) = args.batch_count {
        request.batch_count = count;
    }
    if let Some(size) = args.batch_size {
        request.batch_size = size;
    }
    if let Some(layers) = args.clip_skip {
        request.clip_skip = layers;
    }

    Ok(request)
}

fn print_result(result: &GenerationResult) {
    println!("Generated {} image(s)", result.image_count);
    for path in &result.saved_paths {
        println!("   {}", path.display());
    }
    if let Some(error) = &result.persistence_error {
        println!("   Images were not saved: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Commands};
    use clap::Parser;

    fn parse(args: &[&str]) -> GenerateArgs {
        let mut argv = vec!["diffuse", "generate"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Generate(args) => args,
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn test_request_from_flags() {
        let args = parse(&[
            "a lighthouse at dusk",
            "--negative",
            "blurry",
            "--width",
            "768",
            "--steps",
            "30",
            "--seed",
            "1234",
        ]);
        let request = build_request(&args).unwrap();

        assert_eq!(request.positive_prompt, "a lighthouse at dusk");
        assert_eq!(request.negative_prompt, "blurry");
        assert_eq!(request.width, 768.0);
        assert_eq!(request.height, 512.0);
        assert_eq!(request.sampling_steps, 30.0);
        assert_eq!(request.seed, 1234);
    }

    #[test]
    fn test_non_numeric_seed_is_random() {
        let request = build_request(&parse(&["x", "--seed", "lucky"])).unwrap();
        assert_eq!(request.seed, diffuse_api::RANDOM_SEED);
    }

    #[test]
    fn test_request_from_infotext_with_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.txt");
        std::fs::write(
            &path,
            "old prompt\nNegative prompt: lowres\nSteps: 25, CFG scale: 9, Seed: 42, Size: 640x448, Clip skip: 2",
        )
        .unwrap();

        let args = parse(&["new prompt", "--infotext", path.to_str().unwrap(), "--cfg-scale", "5"]);
        let request = build_request(&args).unwrap();

        assert_eq!(request.positive_prompt, "new prompt");
        assert_eq!(request.negative_prompt, "lowres");
        assert_eq!(request.sampling_steps, 25.0);
        assert_eq!(request.cfg_scale, 5.0);
        assert_eq!(request.seed, 42);
        assert_eq!((request.width, request.height), (640.0, 448.0));
        assert_eq!(request.clip_skip, 2.0);
    }

    #[test]
    fn test_prompt_is_required() {
        assert!(build_request(&parse(&[])).is_err());
    }
}
