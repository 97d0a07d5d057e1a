//! Error hierarchy for the supervisor and its subsystems.
//!
//! Mirrors the error-kind taxonomy of spec section 7: configuration errors
//! are only ever returned from construction, lock/spawn/exit errors are
//! either routed to backoff or escalate to the caller depending on kind,
//! and a handful of failure modes (log/monitor subsystem errors, signals to
//! an already-exited process) are always swallowed rather than modeled as
//! `Err` at all.

use std::time::Duration;
use thiserror::Error;

/// Failure modes of the host-wide device lock (spec section 4.2).
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock path must not be empty")]
    InvalidPath,

    #[error("failed to create lock directory: {0}")]
    DirectoryCreation(#[source] std::io::Error),

    #[error("failed to open lock file: {0}")]
    Open(#[source] std::io::Error),

    #[error("timed out waiting for the lock")]
    Timeout,

    #[error("lock acquisition was cancelled")]
    Cancelled,

    #[error("lock is not held")]
    NotHeld,

    #[error("io error on lock file: {0}")]
    Io(#[source] std::io::Error),
}

/// Top-level error returned by the supervisor's entry point and by
/// construction-time configuration validation.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid supervisor configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to acquire the device lock: {0}")]
    LockAcquisition(#[from] LockError),

    #[error("failed to spawn child process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("child exited with an error (code {code:?})")]
    ChildExited { code: Option<i32> },

    #[error("child exited cleanly after {run:?}, below the {threshold:?} success threshold")]
    ChildShortRun { run: Duration, threshold: Duration },

    #[error("restart attempts exhausted ({attempts} attempts)")]
    AttemptsExhausted { attempts: u32 },

    #[error("supervisor was cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// True for the error kinds spec section 7 says must escape
    /// `Supervisor::run` rather than be absorbed into the backoff loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupervisorError::Cancelled
                | SupervisorError::AttemptsExhausted { .. }
                | SupervisorError::LockAcquisition(_)
                | SupervisorError::ConfigInvalid(_)
        )
    }
}
