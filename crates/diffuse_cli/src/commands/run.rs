//! Run command - Launch the backend and follow its state.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tracing::{info, warn};

use diffuse_core::SupervisorSnapshot;

use super::{load_config, spawn_coordinator, GlobalArgs};

#[derive(Args)]
pub struct RunArgs {
    /// Backend launch script (overrides the configuration)
    #[arg(short, long)]
    executable: Option<PathBuf>,

    /// Checkpoint to switch to once the backend serves HTTP
    #[arg(short, long)]
    model: Option<String>,
}

pub async fn execute(global: &GlobalArgs, args: RunArgs) -> Result<()> {
    let config = load_config(global, args.executable, None)?;
    let handle = spawn_coordinator(config)?;
    let mut updates = handle.subscribe();

    let run = handle.start(None).await?;
    info!("Backend launched (run {})", run);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut model = args.model;
    let mut last_line = String::new();
    let outcome = loop {
        let snapshot = SupervisorSnapshot::clone(&updates.borrow_and_update());
        report(global.json, &snapshot, &mut last_line)?;

        if snapshot.service_url.is_some() {
            if let Some(name) = model.take() {
                if let Err(e) = handle.select_model(name).await {
                    warn!("Could not select model: {}", e);
                }
            }
        }

        if !snapshot.process.has_process() {
            break match (snapshot.crashed, snapshot.last_error) {
                (true, Some(message)) => Err(anyhow::anyhow!(message)),
                (true, None) => Err(anyhow::anyhow!("Backend exited unexpectedly")),
                _ => Ok(()),
            };
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping backend");
                break Ok(());
            }
        }
    };

    handle.shutdown().await?;
    outcome
}

/// Print the snapshot when its visible summary changed.
fn report(json: bool, snapshot: &SupervisorSnapshot, last_line: &mut String) -> Result<()> {
    let line = snapshot.summary();
    if line == *last_line {
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string(snapshot)?);
    } else {
        match &snapshot.last_error {
            Some(error) => println!("{}  last_error={}", line, error),
            None => println!("{}", line),
        }
    }

    *last_line = line;
    Ok(())
}
