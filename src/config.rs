//! Validated configuration surface for a single device's supervisor.
//!
//! Shaped after the teacher's [`crate::config`]-style `AppConfig`: a plain
//! `serde`-derived struct with a `validate()` method. Loading this struct
//! from TOML/env is a caller concern (spec section 1's out-of-scope list);
//! this module only defines the shape and the validation rule set spec
//! section 4.5 enumerates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::Backoff;

/// Audio codec accepted by the child encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Opus,
    Aac,
}

/// Selector for the capture subsystem the child should read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    Alsa,
    Lavfi,
}

impl Default for InputFormat {
    fn default() -> Self {
        InputFormat::Alsa
    }
}

/// Validated configuration for one device's supervisor instance.
///
/// Every field listed here corresponds to an entry in spec section 6's
/// "Configuration surface (enumerated)" table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub device_name: String,
    pub capture_source_id: String,
    #[serde(default)]
    pub input_format: InputFormat,

    pub stream_name: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub bitrate: String,
    pub codec: Codec,
    pub thread_queue: Option<u32>,

    pub output_url: String,
    pub output_format: Option<String>,

    pub lock_dir: PathBuf,
    pub child_binary_path: PathBuf,

    #[serde(skip)]
    pub backoff: Option<Backoff>,

    pub log_dir: Option<PathBuf>,
    pub monitor_interval: Option<Duration>,
    pub stop_timeout: Option<Duration>,

    pub local_record_dir: Option<PathBuf>,
    pub segment_duration_seconds: Option<u64>,
    pub segment_format: Option<String>,
}

/// Default hard-kill grace period; must not be smaller than the slowest
/// codec's flush time, per spec section 4.5.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SEGMENT_DURATION_SECONDS: u64 = 3600;
pub const DEFAULT_SEGMENT_FORMAT: &str = "wav";

impl SupervisorConfig {
    /// Resolves [`Self::stop_timeout`], applying the spec-mandated default.
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT)
    }

    /// Resolves [`Self::segment_duration_seconds`], applying the default.
    pub fn segment_duration_seconds(&self) -> u64 {
        self.segment_duration_seconds
            .unwrap_or(DEFAULT_SEGMENT_DURATION_SECONDS)
    }

    /// Resolves [`Self::segment_format`], applying the default.
    pub fn segment_format(&self) -> &str {
        self.segment_format
            .as_deref()
            .unwrap_or(DEFAULT_SEGMENT_FORMAT)
    }

    /// Validates every required field and constraint from spec section 4.5.
    ///
    /// Construction-only: the restart loop never re-validates a config it
    /// has already accepted.
    pub fn validate(&self) -> Result<(), String> {
        if self.device_name.trim().is_empty() {
            return Err("device_name must not be empty".into());
        }
        if self.capture_source_id.trim().is_empty() {
            return Err("capture_source_id must not be empty".into());
        }
        if self.stream_name.trim().is_empty() {
            return Err("stream_name must not be empty".into());
        }
        if self.sample_rate == 0 {
            return Err("sample_rate must be positive".into());
        }
        if self.channels == 0 || self.channels > 32 {
            return Err("channels must be in [1, 32]".into());
        }
        if self.bitrate.trim().is_empty() {
            return Err("bitrate must not be empty".into());
        }
        if self.output_url.trim().is_empty() {
            return Err("output_url must not be empty".into());
        }
        if self.lock_dir.as_os_str().is_empty() {
            return Err("lock_dir must not be empty".into());
        }
        if self.child_binary_path.as_os_str().is_empty() {
            return Err("child_binary_path must not be empty".into());
        }
        if self.backoff.is_none() {
            return Err("backoff instance is required".into());
        }
        Ok(())
    }
}

/// Keeps the lock-file and segment-file naming rule in one place: keep
/// `[A-Za-z0-9_-]`, replace anything else with `_` (spec section 3).
pub fn sanitize_device_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
