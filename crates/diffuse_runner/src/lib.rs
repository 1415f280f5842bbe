//! # diffuse_runner
//!
//! Backend process supervision for diffuse.
//!
//! This crate launches the image-generation backend (an A1111-style
//! `webui.sh`), watches its output and turns that output into typed events.
//!
//! # Features
//!
//! - **Supervisor**: one owned child process with start/terminate and crash detection
//! - **Line Reassembly**: arbitrary read chunks become complete lines
//! - **Log Parsing**: an ordered pattern table maps lines to [`LogEvent`]s
//! - **Stale Event Filtering**: every event carries the run id that produced it
//!
//! # Example
//!
//! ```rust,no_run
//! use diffuse_runner::{LaunchConfig, LogEventParser, ProcessSupervisor, SupervisorEvent};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, mut rx) = mpsc::unbounded_channel();
//!     let config = LaunchConfig::new().executable("/opt/webui/webui.sh").arg("--api");
//!     let mut supervisor = ProcessSupervisor::new(config, tx);
//!     let parser = LogEventParser::new()?;
//!
//!     supervisor.start(None)?;
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             SupervisorEvent::OutputStarted { run } => {
//!                 supervisor.mark_active(run);
//!             }
//!             SupervisorEvent::Line { line, .. } => {
//!                 println!("{:?}", parser.parse(&line.message));
//!             }
//!             SupervisorEvent::Exited { run, code, requested } => {
//!                 supervisor.on_exit(run, code, requested);
//!                 break;
//!             }
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod lines;
pub mod log_event;
pub mod supervisor;

pub use config::LaunchConfig;
pub use error::{LaunchError, RunnerError, RunnerResult};
pub use lines::LineReassembler;
pub use log_event::{LogEvent, LogEventParser};
pub use supervisor::{
    validate_executable, ExitReport, LogLine, LogStream, ProcessLifecycleState,
    ProcessSupervisor, SupervisorEvent,
};
