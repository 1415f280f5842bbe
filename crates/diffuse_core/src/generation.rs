//! Generation state machine.
//!
//! `idle -> preparingToGenerate -> generating(p) -> finishingUp(p) -> done -> idle`
//!
//! Failures go straight back to `idle`. Only `done` arms the expiry timer.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::expiry::ExpiryTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum GenerationPhase {
    Idle,
    PreparingToGenerate,
    Generating { progress: u8 },
    FinishingUp { progress: u8 },
    Done,
}

impl GenerationPhase {
    /// Progress in percent, if the phase carries one.
    pub fn progress(&self) -> Option<u8> {
        match self {
            Self::Generating { progress } | Self::FinishingUp { progress } => Some(*progress),
            _ => None,
        }
    }

    /// Whether a new request may start from this phase.
    pub fn accepts_request(&self) -> bool {
        matches!(self, Self::Idle | Self::Done)
    }
}

impl std::fmt::Display for GenerationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::PreparingToGenerate => write!(f, "preparingToGenerate"),
            Self::Generating { progress } => write!(f, "generating({}%)", progress),
            Self::FinishingUp { progress } => write!(f, "finishingUp({}%)", progress),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Convert a backend progress fraction to a percentage.
pub fn progress_percent(fraction: f64) -> u8 {
    if !fraction.is_finite() {
        return 0;
    }
    (fraction * 100.0).round().clamp(0.0, 100.0) as u8
}

#[derive(Debug)]
pub struct GenerationMachine {
    phase: GenerationPhase,
    timer: ExpiryTimer,
}

impl GenerationMachine {
    pub fn new(timer: ExpiryTimer) -> Self {
        Self {
            phase: GenerationPhase::Idle,
            timer,
        }
    }

    pub fn phase(&self) -> GenerationPhase {
        self.phase
    }

    pub fn timer(&self) -> &ExpiryTimer {
        &self.timer
    }

    fn set_phase(&mut self, next: GenerationPhase) {
        if next != self.phase {
            debug!("Generation phase: {} -> {}", self.phase, next);
        }
        self.phase = next;
        if next == GenerationPhase::Done {
            self.timer.schedule();
        } else {
            self.timer.cancel();
        }
    }

    /// A request was accepted. Returns false if one is already running.
    pub fn begin(&mut self) -> bool {
        if !self.phase.accepts_request() {
            return false;
        }
        self.set_phase(GenerationPhase::PreparingToGenerate);
        true
    }

    /// Advisory progress from the backend, in percent.
    pub fn on_progress(&mut self, progress: u8) -> bool {
        match self.phase {
            GenerationPhase::PreparingToGenerate | GenerationPhase::Generating { .. } => {
                let next = GenerationPhase::Generating {
                    progress: progress.min(100),
                };
                let changed = next != self.phase;
                if changed {
                    self.set_phase(next);
                }
                changed
            }
            _ => false,
        }
    }

    /// Images arrived and are being written.
    pub fn finishing(&mut self) -> bool {
        let progress = match self.phase {
            GenerationPhase::PreparingToGenerate => 100,
            GenerationPhase::Generating { progress } => progress,
            _ => return false,
        };
        self.set_phase(GenerationPhase::FinishingUp { progress });
        true
    }

    /// Results were handed off.
    pub fn complete(&mut self) -> bool {
        if !matches!(self.phase, GenerationPhase::FinishingUp { .. }) {
            return false;
        }
        self.set_phase(GenerationPhase::Done);
        true
    }

    /// The request failed. Goes straight to idle.
    pub fn fail(&mut self) {
        self.set_phase(GenerationPhase::Idle);
    }

    /// Handle a fired expiry. Returns true if the phase reverted to idle.
    pub fn on_expired(&mut self, epoch: u64) -> bool {
        if !self.timer.claim(epoch) || self.phase != GenerationPhase::Done {
            return false;
        }
        debug!("Generation phase expired: done -> idle");
        self.phase = GenerationPhase::Idle;
        true
    }

    pub fn reset(&mut self) {
        self.set_phase(GenerationPhase::Idle);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::expiry::{ExpiryFired, TimerKind};

    fn machine() -> (GenerationMachine, mpsc::UnboundedReceiver<ExpiryFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer = ExpiryTimer::new(TimerKind::Generation, Duration::from_secs(3), tx);
        (GenerationMachine::new(timer), rx)
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0.0), 0);
        assert_eq!(progress_percent(0.424), 42);
        assert_eq!(progress_percent(0.995), 100);
        assert_eq!(progress_percent(1.7), 100);
        assert_eq!(progress_percent(-0.2), 0);
        assert_eq!(progress_percent(f64::NAN), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sequence_and_expiry() {
        let (mut m, mut rx) = machine();

        assert!(m.begin());
        assert_eq!(m.phase(), GenerationPhase::PreparingToGenerate);
        assert!(!m.begin());

        assert!(m.on_progress(35));
        assert_eq!(m.phase(), GenerationPhase::Generating { progress: 35 });
        assert!(m.finishing());
        assert_eq!(m.phase(), GenerationPhase::FinishingUp { progress: 35 });
        assert!(!m.on_progress(80));
        assert!(m.complete());
        assert_eq!(m.phase(), GenerationPhase::Done);

        tokio::time::advance(Duration::from_millis(2_900)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.unwrap();
        assert!(m.on_expired(fired.epoch));
        assert_eq!(m.phase(), GenerationPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_request_from_done_cancels_expiry() {
        let (mut m, mut rx) = machine();
        m.begin();
        m.finishing();
        m.complete();
        let stale = m.timer().epoch();

        assert!(m.begin());
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        assert!(rx.try_recv().is_err());
        assert!(!m.on_expired(stale));
        assert_eq!(m.phase(), GenerationPhase::PreparingToGenerate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_skips_done() {
        let (mut m, _rx) = machine();
        m.begin();
        m.on_progress(10);
        m.fail();

        assert_eq!(m.phase(), GenerationPhase::Idle);
        assert!(!m.timer().is_pending());
        assert!(!m.complete());
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_value(GenerationPhase::Generating { progress: 42 }).unwrap();
        assert_eq!(json, serde_json::json!({"phase": "generating", "progress": 42}));
        let json = serde_json::to_value(GenerationPhase::PreparingToGenerate).unwrap();
        assert_eq!(json, serde_json::json!({"phase": "preparingToGenerate"}));
    }
}
