use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Timer misuse: starting an already-started timer, or postponing one that
/// never started or has already elapsed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer was already started")]
    AlreadyStarted,
    #[error("timer was not yet active")]
    NotActive,
}

#[derive(Debug)]
struct TimerState {
    fired: AtomicBool,
    notify: Notify,
}

/// A single-shot deadline, cheap to create and replace rather than reset in
/// place (see the crate's `README`/design notes: rearming after expiry is
/// legal and simply produces a fresh `Timer`).
#[derive(Debug)]
pub struct Timer {
    state: Arc<TimerState>,
    handle: Option<JoinHandle<()>>,
    fire_at: Option<Instant>,
}

impl Timer {
    /// Creates an unstarted timer.
    pub fn new() -> Self {
        Self {
            state: Arc::new(TimerState {
                fired: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            handle: None,
            fire_at: None,
        }
    }

    fn arm(&mut self, duration: Duration) {
        self.fire_at = Some(Instant::now() + duration);
        let state = self.state.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            state.fired.store(true, Ordering::SeqCst);
            state.notify.notify_waiters();
        }));
    }

    /// Arms the timer for `duration` from now. Fails if already started.
    pub fn start(&mut self, duration: Duration) -> Result<(), TimerError> {
        if self.fire_at.is_some() {
            return Err(TimerError::AlreadyStarted);
        }
        self.arm(duration);
        Ok(())
    }

    /// Cancels the timer. Idempotent, and a no-op on a timer that never
    /// started. A cancelled timer never signals completion.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Seconds remaining until the deadline. `None` before `start`. May be
    /// negative once the deadline has passed.
    pub fn time_left(&self) -> Option<f64> {
        let fire_at = self.fire_at?;
        let now = Instant::now();
        Some(if now >= fire_at {
            -(now - fire_at).as_secs_f64()
        } else {
            (fire_at - now).as_secs_f64()
        })
    }

    /// True once the deadline has elapsed (and was not cancelled first).
    pub fn has_completed(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }

    /// Suspends until the deadline elapses. Never resolves on an unstarted
    /// or cancelled timer. Safe to drop mid-wait: dropping this future never
    /// consumes the notification, so a loser of a race can simply be
    /// re-awaited later.
    pub async fn wait_until_completed(&self) -> bool {
        loop {
            if self.has_completed() {
                return true;
            }
            self.state.notify.notified().await;
        }
    }

    /// Legal only while `time_left()` is positive. Cancels this timer and
    /// returns a fresh one armed for `extra_duration + remaining`.
    pub fn postpone(&mut self, extra_duration: Duration) -> Result<Timer, TimerError> {
        let left = self.time_left().filter(|l| *l > 0.0);
        let Some(left) = left else {
            return Err(TimerError::NotActive);
        };

        self.cancel();
        let mut postponed = Timer::new();
        postponed.arm(Duration::from_secs_f64(extra_duration.as_secs_f64() + left));
        Ok(postponed)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_twice_fails() {
        let mut t = Timer::new();
        t.start(Duration::from_secs(10)).unwrap();
        assert_eq!(t.start(Duration::from_secs(1)), Err(TimerError::AlreadyStarted));
    }

    #[tokio::test]
    async fn unstarted_time_left_is_none() {
        let t = Timer::new();
        assert_eq!(t.time_left(), None);
        assert!(!t.has_completed());
    }

    #[tokio::test]
    async fn fires_and_completes() {
        let mut t = Timer::new();
        t.start(Duration::from_millis(5)).unwrap();
        assert!(t.wait_until_completed().await);
        assert!(t.has_completed());
        assert!(t.time_left().unwrap() <= 0.0);
    }

    #[tokio::test]
    async fn cancel_before_fire_never_completes() {
        let mut t = Timer::new();
        t.start(Duration::from_secs(30)).unwrap();
        t.cancel();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!t.has_completed());
    }

    #[tokio::test]
    async fn postpone_requires_positive_time_left() {
        let mut t = Timer::new();
        assert_eq!(
            t.postpone(Duration::from_secs(1)).unwrap_err(),
            TimerError::NotActive
        );

        t.start(Duration::from_millis(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            t.postpone(Duration::from_secs(1)).unwrap_err(),
            TimerError::NotActive
        );
    }

    #[tokio::test]
    async fn postpone_extends_from_remaining() {
        let mut t = Timer::new();
        t.start(Duration::from_millis(50)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let left_before = t.time_left().unwrap();
        let postponed = t.postpone(Duration::from_millis(100)).unwrap();
        assert!(!t.has_completed());
        let left_after = postponed.time_left().unwrap();
        assert!(left_after > left_before);
    }
}
