//! A cheap, lock-consistent snapshot of a running supervisor's counters
//! (spec section 4.6).
//!
//! [`MetricsSnapshot`] is a plain value: cloning the supervisor's atomics
//! and a single mutex-guarded timestamp into it is far cheaper than
//! exposing the supervisor's internals directly, and keeps callers from
//! observing a torn read across fields.

use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Point-in-time view of one device supervisor's state and counters.
///
/// `current_child_started_at_unix == 0` means the current child has never
/// been started (e.g. the supervisor has not yet acquired the device
/// lock, or is between restart attempts).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub device_name: String,
    pub stream_name: String,
    pub state: SupervisorStateLabel,
    pub current_child_started_at_unix: u64,
    pub uptime_seconds: u64,
    pub total_attempts: u32,
    pub total_failures: u32,
}

/// Serializable mirror of [`crate::supervisor::SupervisorState`], kept
/// separate so `metrics` has no dependency on the supervisor's internal
/// atomic encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorStateLabel {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
    Stopped,
}

impl MetricsSnapshot {
    /// Builds a snapshot from raw counters. `started_at` is `None` when
    /// no child is currently running.
    pub fn new(
        device_name: impl Into<String>,
        stream_name: impl Into<String>,
        state: SupervisorStateLabel,
        started_at: Option<SystemTime>,
        total_attempts: u32,
        total_failures: u32,
    ) -> Self {
        let current_child_started_at_unix = started_at
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let uptime_seconds = started_at
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .unwrap_or(Duration::ZERO)
            .as_secs();

        Self {
            device_name: device_name.into(),
            stream_name: stream_name.into(),
            state,
            current_child_started_at_unix,
            uptime_seconds,
            total_attempts,
            total_failures,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == SupervisorStateLabel::Running
    }
}
