//! Exponential backoff policy with success-based reset (spec section 4.1).
//!
//! All operations are thread-safe; the only one that can suspend is
//! [`Backoff::wait`], which races the current delay against a
//! cancellation token so a caller can return promptly.

use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Construction-time parameters, also the values [`Backoff::reset`]
/// restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub success_threshold: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            success_threshold: Duration::from_secs(10),
            max_attempts: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BackoffState {
    current_delay: Duration,
    attempts: u32,
    consecutive_failures: u32,
}

/// Exponential backoff with a success-based reset, matching spec section
/// 4.1's state tuple `(initial_delay, max_delay, success_threshold,
/// max_attempts, current_delay, attempts, consecutive_failures)`.
#[derive(Debug)]
pub struct Backoff {
    settings: BackoffSettings,
    state: Mutex<BackoffState>,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        let initial = BackoffState {
            current_delay: settings.initial_delay,
            attempts: 0,
            consecutive_failures: 0,
        };
        Self {
            settings,
            state: Mutex::new(initial),
        }
    }

    /// `attempts++`; `consecutive_failures++`; doubles `current_delay`
    /// (clamped to `max_delay`); resets to `initial_delay` on overflow.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        Self::apply_failure(&self.settings, &mut state);
    }

    fn apply_failure(settings: &BackoffSettings, state: &mut BackoffState) {
        state.attempts = state.attempts.saturating_add(1);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        let doubled = state.current_delay.checked_mul(2);
        state.current_delay = match doubled {
            Some(d) if d > Duration::ZERO => std::cmp::min(d, settings.max_delay),
            _ => settings.initial_delay,
        };
    }

    /// `attempts++`; if `run_duration > success_threshold`, resets the
    /// delay and failure counter; otherwise behaves exactly like
    /// [`Backoff::record_failure`] (a short run is still a failure).
    pub fn record_success(&self, run_duration: Duration) {
        let mut state = self.state.lock().unwrap();
        if run_duration > self.settings.success_threshold {
            state.attempts = state.attempts.saturating_add(1);
            state.current_delay = self.settings.initial_delay;
            state.consecutive_failures = 0;
        } else {
            Self::apply_failure(&self.settings, &mut state);
        }
    }

    /// `attempts >= max_attempts`. A backoff with `max_attempts == 0` is
    /// fail-safe: it reports "stop" immediately.
    pub fn should_stop(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.attempts >= self.settings.max_attempts
    }

    /// Sleeps for [`Backoff::current_delay`] or until `token` is
    /// cancelled, whichever happens first.
    pub async fn wait(&self, token: &CancellationToken) {
        let delay = self.current_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => {}
        }
    }

    /// Restores construction-time values.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.current_delay = self.settings.initial_delay;
        state.attempts = 0;
        state.consecutive_failures = 0;
    }

    pub fn current_delay(&self) -> Duration {
        self.state.lock().unwrap().current_delay
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().unwrap().attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.settings.max_attempts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().unwrap().consecutive_failures
    }

    pub fn success_threshold(&self) -> Duration {
        self.settings.success_threshold
    }
}
