//! Parse-log command - Show the events found in a captured backend log.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::info;

use diffuse_runner::{LineReassembler, LogEvent, LogEventParser};

use super::GlobalArgs;

#[derive(Args)]
pub struct ParseLogArgs {
    /// Log file captured from the backend's stdout/stderr
    file: PathBuf,

    /// Also list lines that matched no pattern
    #[arg(long)]
    all: bool,
}

#[derive(Debug, Serialize)]
struct ParsedLine {
    line: usize,
    event: LogEvent,
}

pub async fn execute(global: &GlobalArgs, args: ParseLogArgs) -> Result<()> {
    info!("Parsing backend log: {}", args.file.display());

    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let parser = LogEventParser::new()?;
    let parsed = parse_bytes(&parser, &bytes);

    let recognized = parsed.iter().filter(|p| p.event.is_recognized()).count();
    let shown = parsed.iter().filter(|p| args.all || p.event.is_recognized());

    if global.json {
        for entry in shown {
            println!("{}", serde_json::to_string(entry)?);
        }
    } else {
        for entry in shown {
            println!("{:>6}  {}", entry.line, describe(&entry.event));
        }
        println!();
        println!("{} line(s), {} recognized", parsed.len(), recognized);
    }

    Ok(())
}

/// Split the log exactly as the supervisor would and parse every line.
fn parse_bytes(parser: &LogEventParser, bytes: &[u8]) -> Vec<ParsedLine> {
    let mut lines = LineReassembler::new();
    let mut all = lines.push(bytes);
    all.extend(lines.finish());

    all.iter()
        .enumerate()
        .map(|(i, text)| ParsedLine {
            line: i + 1,
            event: parser.parse(text),
        })
        .collect()
}

fn describe(event: &LogEvent) -> String {
    match event {
        LogEvent::ServiceReady(url) => format!("service ready at {}", url),
        LogEvent::ModelLoadStarted => "model load started".to_string(),
        LogEvent::ModelLoadTiming(secs) => format!("model loaded in {:.1}s", secs),
        LogEvent::ModelLoadFailureMarker => "model load failed".to_string(),
        LogEvent::Unrecognized(text) => format!("- {}", text),
    }
}
