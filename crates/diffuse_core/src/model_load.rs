//! Model load state machine.
//!
//! ```text
//!            request / backend active
//!   idle ──────────────────────────────► launching
//!    ▲                                     │ load started
//!    │ expiry (5s) or new request          ▼
//!    │                                  isLoading
//!  done / failed ◄──── timing / failure ───┘
//! ```
//!
//! `done` and `failed` arm an expiry timer; any other write disarms it.

use diffuse_runner::LogEvent;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::expiry::ExpiryTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelLoadPhase {
    Idle,
    Launching,
    IsLoading,
    Done,
    Failed,
}

impl ModelLoadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn is_loading(&self) -> bool {
        matches!(self, Self::Launching | Self::IsLoading)
    }
}

impl std::fmt::Display for ModelLoadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::IsLoading => "isLoading",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
pub struct ModelLoadMachine {
    phase: ModelLoadPhase,
    elapsed_secs: f64,
    load_pending: bool,
    block_on_failure: bool,
    timer: ExpiryTimer,
}

impl ModelLoadMachine {
    pub fn new(timer: ExpiryTimer, block_on_failure: bool) -> Self {
        Self {
            phase: ModelLoadPhase::Idle,
            elapsed_secs: 0.0,
            load_pending: false,
            block_on_failure,
            timer,
        }
    }

    pub fn phase(&self) -> ModelLoadPhase {
        self.phase
    }

    /// Seconds reported by the last successful load, 0 otherwise.
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed_secs
    }

    pub fn timer(&self) -> &ExpiryTimer {
        &self.timer
    }

    /// Whether a generation may be submitted in the current phase.
    pub fn allows_generation(&self) -> bool {
        if self.block_on_failure {
            !matches!(self.phase, ModelLoadPhase::IsLoading | ModelLoadPhase::Failed)
        } else {
            true
        }
    }

    fn set_phase(&mut self, next: ModelLoadPhase) {
        debug!("Model load phase: {} -> {}", self.phase, next);
        self.phase = next;
        if next.is_terminal() {
            self.timer.schedule();
        } else {
            self.timer.cancel();
        }
    }

    /// Note that the next backend start will load a model.
    pub fn expect_load(&mut self) {
        self.load_pending = true;
    }

    /// The backend became active. Starts the pending load, if any.
    pub fn on_backend_active(&mut self) -> bool {
        if self.load_pending && self.phase == ModelLoadPhase::Idle {
            self.load_pending = false;
            self.set_phase(ModelLoadPhase::Launching);
            true
        } else {
            false
        }
    }

    /// Explicit new load request (e.g. a checkpoint switch).
    pub fn request_load(&mut self) {
        self.load_pending = false;
        self.elapsed_secs = 0.0;
        self.set_phase(ModelLoadPhase::Launching);
    }

    /// Apply a parsed log event. Returns true if the phase changed.
    pub fn on_event(&mut self, event: &LogEvent) -> bool {
        match event {
            LogEvent::ModelLoadStarted
                if matches!(self.phase, ModelLoadPhase::Idle | ModelLoadPhase::Launching) =>
            {
                self.load_pending = false;
                self.set_phase(ModelLoadPhase::IsLoading);
                true
            }
            LogEvent::ModelLoadTiming(secs) if self.phase.is_loading() => {
                self.elapsed_secs = *secs;
                self.set_phase(ModelLoadPhase::Done);
                true
            }
            LogEvent::ModelLoadFailureMarker if self.phase.is_loading() => {
                self.set_phase(ModelLoadPhase::Failed);
                true
            }
            _ => false,
        }
    }

    /// A load failed outside the log stream (e.g. a rejected checkpoint switch).
    pub fn fail(&mut self) -> bool {
        if self.phase.is_loading() {
            self.set_phase(ModelLoadPhase::Failed);
            true
        } else {
            false
        }
    }

    /// Handle a fired expiry. Returns true if the phase reverted to idle.
    pub fn on_expired(&mut self, epoch: u64) -> bool {
        if !self.timer.claim(epoch) || !self.phase.is_terminal() {
            return false;
        }
        debug!("Model load phase expired: {} -> idle", self.phase);
        self.phase = ModelLoadPhase::Idle;
        self.elapsed_secs = 0.0;
        true
    }

    /// Forget everything. Used when the backend goes away.
    pub fn reset(&mut self) {
        self.load_pending = false;
        self.elapsed_secs = 0.0;
        if self.phase != ModelLoadPhase::Idle {
            self.set_phase(ModelLoadPhase::Idle);
        } else {
            self.timer.cancel();
        }
    }
}
