//! Cancel-able single-shot expiry timers.
//!
//! A timer is armed with a delay and, when the delay elapses, posts an
//! [`ExpiryFired`] message carrying the epoch it was armed with. Every
//! `schedule` or `cancel` bumps the epoch and aborts the previous task, and
//! the owner only acts on a fired message whose epoch it can still
//! [`claim`](ExpiryTimer::claim). A superseded timer therefore never
//! reverts a newer state.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Which state machine a timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ModelLoad,
    Generation,
}

/// Message posted when a timer's delay elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryFired {
    pub kind: TimerKind,
    pub epoch: u64,
}

#[derive(Debug)]
pub struct ExpiryTimer {
    kind: TimerKind,
    delay: Duration,
    epoch: u64,
    pending: Option<AbortHandle>,
    notify: mpsc::UnboundedSender<ExpiryFired>,
}

impl ExpiryTimer {
    pub fn new(kind: TimerKind, delay: Duration, notify: mpsc::UnboundedSender<ExpiryFired>) -> Self {
        Self {
            kind,
            delay,
            epoch: 0,
            pending: None,
            notify,
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Arm the timer, replacing any pending one. Returns the new epoch.
    pub fn schedule(&mut self) -> u64 {
        self.cancel();

        let fired = ExpiryFired {
            kind: self.kind,
            epoch: self.epoch,
        };
        let deadline = tokio::time::Instant::now() + self.delay;
        let notify = self.notify.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = notify.send(fired);
        });

        self.pending = Some(task.abort_handle());
        self.epoch
    }

    /// Disarm the timer. Any message already posted becomes unclaimable.
    pub fn cancel(&mut self) {
        self.epoch += 1;
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }

    /// Accept a fired message. True exactly once per armed epoch.
    pub fn claim(&mut self, epoch: u64) -> bool {
        if self.pending.is_some() && epoch == self.epoch {
            self.pending = None;
            true
        } else {
            false
        }
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(delay_secs: u64) -> (ExpiryTimer, mpsc::UnboundedReceiver<ExpiryFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ExpiryTimer::new(TimerKind::ModelLoad, Duration::from_secs(delay_secs), tx),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let (mut timer, mut rx) = timer(5);
        let epoch = timer.schedule();

        tokio::time::advance(Duration::from_millis(4_900)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, ExpiryFired { kind: TimerKind::ModelLoad, epoch });
        assert!(timer.claim(fired.epoch));
        assert!(!timer.claim(fired.epoch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_timer_never_fires() {
        let (mut timer, mut rx) = timer(5);
        let first = timer.schedule();

        tokio::time::advance(Duration::from_secs(3)).await;
        let second = timer.schedule();
        assert_ne!(first, second);

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.epoch, second);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_is_unclaimable() {
        let (mut timer, mut rx) = timer(1);
        let epoch = timer.schedule();
        timer.cancel();
        assert!(!timer.is_pending());

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert!(!timer.claim(epoch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_message_after_reschedule_is_rejected() {
        let (mut timer, _rx) = timer(1);
        let stale = timer.schedule();
        timer.schedule();

        assert!(!timer.claim(stale));
        assert!(timer.is_pending());
    }
}
