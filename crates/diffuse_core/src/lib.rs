//! # diffuse_core
//!
//! State machines and the coordinating actor for diffuse.
//!
//! # Overview
//!
//! - [`ModelLoadMachine`]: `idle → launching → isLoading → done/failed`,
//!   driven by parsed backend output
//! - [`GenerationMachine`]: `idle → preparingToGenerate → generating →
//!   finishingUp → done`, driven by the generation request
//! - [`ExpiryTimer`]: reverts terminal phases to idle unless superseded
//! - [`Coordinator`]: the single task that owns all of the above plus the
//!   backend process, reachable through a [`CoordinatorHandle`]
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use diffuse_api::{GenerationRequest, WebUiClient};
//! use diffuse_core::{Coordinator, ProcessLifecycleState, SupervisorConfig};
//! use diffuse_store::DiskImageWriter;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SupervisorConfig::load(None)?;
//!     let client = WebUiClient::new(config.request_timeout())?;
//!     let handle = Coordinator::spawn(config, Arc::new(client), Arc::new(DiskImageWriter::new()))?;
//!
//!     handle.start(None).await?;
//!     handle
//!         .wait_for(Duration::from_secs(300), |s| s.process == ProcessLifecycleState::Active)
//!         .await;
//!
//!     let result = handle.submit(GenerationRequest::new("a lighthouse at dusk")).await?;
//!     println!("saved {:?}", result.saved_paths);
//!
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod expiry;
pub mod generation;
pub mod model_load;
pub mod snapshot;

pub use catalog::{ModelCatalog, ModelFile};
pub use config::{SupervisorConfig, CONFIG_FILE};
pub use coordinator::{Coordinator, CoordinatorHandle, GenerationOutcome};
pub use error::{CoreError, CoreResult, GenerationError};
pub use expiry::{ExpiryFired, ExpiryTimer, TimerKind};
pub use generation::{progress_percent, GenerationMachine, GenerationPhase};
pub use model_load::{ModelLoadMachine, ModelLoadPhase};
pub use snapshot::{GenerationResult, SupervisorSnapshot};

pub use diffuse_runner::ProcessLifecycleState;
