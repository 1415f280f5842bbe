//! Models command - List checkpoints in the models directory.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tracing::info;

use diffuse_core::ModelCatalog;

use super::{load_config, print_json, GlobalArgs};

#[derive(Args)]
pub struct ModelsArgs {
    /// Directory to scan (overrides `models_dir` in the configuration)
    #[arg(short, long)]
    dir: Option<PathBuf>,
}

pub async fn execute(global: &GlobalArgs, args: ModelsArgs) -> Result<()> {
    let config = load_config(global, None, None)?;
    let Some(dir) = args.dir.or(config.models_dir) else {
        anyhow::bail!("No models directory: pass --dir or set models_dir in the configuration");
    };

    info!("Scanning {}", dir.display());
    let catalog = ModelCatalog::scan(&dir)?;

    if global.json {
        return print_json(&catalog);
    }

    if catalog.is_empty() {
        println!("No checkpoints found in {}", dir.display());
        return Ok(());
    }

    for model in &catalog.models {
        let marker = if config.selected_model.as_deref() == Some(model.name.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{} {:<60} {}", marker, model.name, format_size(model.size_bytes));
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    let mib = bytes as f64 / MIB;
    if mib >= 1024.0 {
        format!("{:.1} GiB", mib / 1024.0)
    } else {
        format!("{:.1} MiB", mib)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(2 * 1024 * 1024), "2.0 MiB");
        assert_eq!(format_size(4_265_380_512), "4.0 GiB");
    }
}
