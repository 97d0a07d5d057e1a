//! The restart state machine (spec section 4.5): acquires the device
//! lock, spawns the child, watches it, and restarts it under the
//! configured [`Backoff`] until cancelled or the backoff gives up.
//!
//! Grounded in the teacher's process-management idiom (`process_manager`'s
//! spawn/kill helpers plus its `log!`-macro event style) generalized from
//! a single watched child to the full lock-acquire/spawn/monitor/restart
//! cycle spec section 4.5 describes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::command::build_command_args;
use crate::config::{sanitize_device_name, SupervisorConfig};
use crate::error::SupervisorError;
use crate::log;
use crate::log_sink::RotatingSink;
use crate::lock::DeviceLock;
use crate::logger::LogLevel;
use crate::metrics::{MetricsSnapshot, SupervisorStateLabel};
use crate::monitor::{AlertSink, ResourceMonitor, Thresholds};
use crate::process;

const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_millis(500);

/// The supervisor's lifecycle state, spec section 4.5: `Idle -> Starting
/// -> Running -> (Stopping | Failed) -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Failed = 4,
    Stopped = 5,
}

impl SupervisorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SupervisorState::Idle,
            1 => SupervisorState::Starting,
            2 => SupervisorState::Running,
            3 => SupervisorState::Stopping,
            4 => SupervisorState::Failed,
            _ => SupervisorState::Stopped,
        }
    }

    fn label(self) -> SupervisorStateLabel {
        match self {
            SupervisorState::Idle => SupervisorStateLabel::Idle,
            SupervisorState::Starting => SupervisorStateLabel::Starting,
            SupervisorState::Running => SupervisorStateLabel::Running,
            SupervisorState::Stopping => SupervisorStateLabel::Stopping,
            SupervisorState::Failed => SupervisorStateLabel::Failed,
            SupervisorState::Stopped => SupervisorStateLabel::Stopped,
        }
    }
}

#[derive(Default)]
struct InstanceState {
    pid: Option<i32>,
    log_sink: Option<Arc<RotatingSink>>,
    started_at: Option<SystemTime>,
}

struct LoggingAlertSink {
    device_name: String,
}

impl AlertSink for LoggingAlertSink {
    fn on_alerts(&self, pid: i32, alerts: &[crate::monitor::Alert]) {
        for alert in alerts {
            log!(
                LogLevel::Warn,
                "device={} pid={} resource_alert level={:?} resource={:?} value={} message={}",
                self.device_name,
                pid,
                alert.level,
                alert.resource,
                alert.raw_value,
                alert.message
            );
        }
    }
}

/// Supervises one device's capture child process for the lifetime of the
/// [`Supervisor::run`] call.
pub struct Supervisor {
    config: SupervisorConfig,
    backoff: Backoff,
    state: AtomicU8,
    device_lock: AsyncMutex<DeviceLock>,
    instance: StdMutex<InstanceState>,
    total_attempts: AtomicU32,
    total_failures: AtomicU32,
    monitor: ResourceMonitor,
}

impl Supervisor {
    /// Validates `config` and builds a supervisor instance. Does not
    /// acquire the device lock or spawn anything; call [`Supervisor::run`]
    /// for that.
    pub fn new(mut config: SupervisorConfig) -> Result<Self, SupervisorError> {
        config.validate().map_err(SupervisorError::ConfigInvalid)?;
        let backoff = config
            .backoff
            .take()
            .ok_or_else(|| SupervisorError::ConfigInvalid("backoff instance is required".into()))?;

        let lock_file_name = format!("{}.lock", sanitize_device_name(&config.device_name));
        let lock_path = config.lock_dir.join(lock_file_name);
        let device_lock = DeviceLock::new(lock_path).map_err(SupervisorError::LockAcquisition)?;

        Ok(Self {
            monitor: ResourceMonitor::new("/proc", Thresholds::default()),
            config,
            backoff,
            state: AtomicU8::new(SupervisorState::Idle as u8),
            device_lock: AsyncMutex::new(device_lock),
            instance: StdMutex::new(InstanceState::default()),
            total_attempts: AtomicU32::new(0),
            total_failures: AtomicU32::new(0),
        })
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// A cheap, consistent snapshot of this supervisor's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        let instance = self.instance.lock().unwrap();
        MetricsSnapshot::new(
            self.config.device_name.clone(),
            self.config.stream_name.clone(),
            self.state().label(),
            instance.started_at,
            self.total_attempts.load(Ordering::Relaxed),
            self.total_failures.load(Ordering::Relaxed),
        )
    }

    /// Runs the acquire/spawn/monitor/restart cycle until `cancel` fires
    /// or the backoff policy gives up. Per spec section 4.5 step f and
    /// section 7, both outcomes are terminal and escape as an error: a
    /// cancelled run returns `SupervisorError::Cancelled`, never `Ok`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        {
            let mut lock = self.device_lock.lock().await;
            lock.acquire(LOCK_ACQUIRE_TIMEOUT, &cancel)
                .await
                .map_err(SupervisorError::LockAcquisition)?;
        }

        let result = self.run_restart_loop(&cancel).await;

        {
            let mut lock = self.device_lock.lock().await;
            lock.close();
        }
        self.set_state(SupervisorState::Stopped);

        if let Err(ref e) = result {
            debug_assert!(e.is_terminal(), "run() must only ever surface terminal error kinds");
            log!(
                LogLevel::Info,
                "device={} event=supervisor_exit reason={}",
                self.config.device_name,
                e
            );
        }

        result
    }

    async fn run_restart_loop(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        loop {
            if cancel.is_cancelled() {
                self.set_state(SupervisorState::Stopped);
                return Err(SupervisorError::Cancelled);
            }

            if self.backoff.should_stop() {
                self.set_state(SupervisorState::Failed);
                return Err(SupervisorError::AttemptsExhausted {
                    attempts: self.backoff.attempts(),
                });
            }

            self.set_state(SupervisorState::Starting);
            match self.spawn_and_watch_once(cancel).await {
                Ok(run_duration) if run_duration >= self.backoff.success_threshold() => {
                    // A genuine recovery: record it and loop immediately,
                    // with no backoff delay (spec section 4.5 step g).
                    self.total_attempts.fetch_add(1, Ordering::Relaxed);
                    self.backoff.record_success(run_duration);
                    log!(
                        LogLevel::Info,
                        "device={} event=stream_recovery run_duration_secs={}",
                        self.config.device_name,
                        run_duration.as_secs()
                    );
                }
                Ok(run_duration) => {
                    self.total_attempts.fetch_add(1, Ordering::Relaxed);
                    self.total_failures.fetch_add(1, Ordering::Relaxed);
                    let reason = SupervisorError::ChildShortRun {
                        run: run_duration,
                        threshold: self.backoff.success_threshold(),
                    };
                    log!(
                        LogLevel::Warn,
                        "device={} event=stream_short_run_failure attempt={} reason={}",
                        self.config.device_name,
                        self.backoff.attempts() + 1,
                        reason
                    );
                    self.set_state(SupervisorState::Stopping);
                    self.backoff.wait(cancel).await;
                    self.backoff.record_failure();
                }
                Err(SpawnOutcome::Cancelled) => {
                    self.set_state(SupervisorState::Stopped);
                    return Err(SupervisorError::Cancelled);
                }
                Err(SpawnOutcome::Failed(e)) => {
                    self.total_attempts.fetch_add(1, Ordering::Relaxed);
                    self.total_failures.fetch_add(1, Ordering::Relaxed);
                    log!(
                        LogLevel::Error,
                        "device={} event=stream_failure attempt={} error={}",
                        self.config.device_name,
                        self.backoff.attempts() + 1,
                        e
                    );
                    self.set_state(SupervisorState::Stopping);
                    self.backoff.wait(cancel).await;
                    self.backoff.record_failure();
                }
            }

            if self.backoff.should_stop() {
                self.set_state(SupervisorState::Failed);
                return Err(SupervisorError::AttemptsExhausted {
                    attempts: self.backoff.attempts(),
                });
            }
        }
    }

    /// Spawns one child and waits for it to exit, a cancellation, or a
    /// graceful-stop timeout. Returns the wall-clock run duration on a
    /// normal exit.
    async fn spawn_and_watch_once(&self, cancel: &CancellationToken) -> Result<Duration, SpawnOutcome> {
        let args = build_command_args(&self.config);
        let mut command = Command::new(&self.config.child_binary_path);
        command.args(&args);

        let mut child = process::spawn_independent(&mut command)
            .map_err(|e| SpawnOutcome::Failed(SupervisorError::SpawnFailed(e)))?;
        let pid = child.id().map(|p| p as i32);

        let log_sink = self.open_log_sink().map(Arc::new).ok();
        if let (Some(sink), Some(stderr)) = (log_sink.clone(), child.stderr.take()) {
            tokio::spawn(forward_stderr_to_sink(stderr, sink));
        }

        let started_at = SystemTime::now();
        {
            let mut instance = self.instance.lock().unwrap();
            instance.pid = pid;
            instance.log_sink = log_sink;
            instance.started_at = Some(started_at);
        }
        self.set_state(SupervisorState::Running);

        // Exactly one waiter task per child run; its result is delivered
        // through a capacity-1 oneshot channel (spec section 4.5's
        // concurrency discipline, SPEC_FULL.md section 4.5).
        let (wait_tx, mut wait_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let res = child.wait().await;
            let _ = wait_tx.send(res);
        });

        let monitor_interval = self.config.monitor_interval.unwrap_or(DEFAULT_MONITOR_INTERVAL);
        let monitor_cancel = cancel.clone();
        let monitor_handle = pid.map(|pid| {
            let sink = LoggingAlertSink {
                device_name: self.config.device_name.clone(),
            };
            let monitor = &self.monitor;
            async move {
                monitor
                    .run_loop(pid, monitor_interval, Some(&sink), &monitor_cancel)
                    .await;
            }
        });

        let start = Instant::now();
        let exit_result = if let Some(monitor_fut) = monitor_handle {
            tokio::select! {
                res = &mut wait_rx => res,
                _ = monitor_fut => {
                    // The monitor loop only exits early on cancellation or
                    // a dead pid; either way the waiter task still owns
                    // the final result.
                    (&mut wait_rx).await
                }
                _ = cancel.cancelled() => {
                    return self.graceful_stop(pid, wait_rx).await;
                }
            }
        } else {
            tokio::select! {
                res = &mut wait_rx => res,
                _ = cancel.cancelled() => {
                    return self.graceful_stop(pid, wait_rx).await;
                }
            }
        };

        if let Some(pid) = pid {
            self.instance.lock().unwrap().pid = None;
            self.monitor.drop_pid(pid);
        }

        match exit_result {
            Ok(Ok(status)) if status.success() => Ok(start.elapsed()),
            Ok(Ok(status)) => Err(SpawnOutcome::Failed(SupervisorError::ChildExited {
                code: status.code(),
            })),
            Ok(Err(e)) => Err(SpawnOutcome::Failed(SupervisorError::Io(e))),
            Err(_) => Err(SpawnOutcome::Failed(SupervisorError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "waiter task dropped without reporting an exit status",
            )))),
        }
    }

    /// Signals the child to stop and waits for the waiter task's result,
    /// escalating to a SIGKILL tree if it hasn't exited by `stop_timeout`.
    ///
    /// The kill timer runs as its own task (SPEC_FULL.md section 4.5's
    /// "independent kill-timer task"), cancelled if the waiter reports an
    /// exit first; `kill_tree`'s blocking sleep-then-reap work is
    /// offloaded to `spawn_blocking` so it never stalls this runtime.
    async fn graceful_stop(
        &self,
        pid: Option<i32>,
        wait_rx: tokio::sync::oneshot::Receiver<std::io::Result<std::process::ExitStatus>>,
    ) -> Result<Duration, SpawnOutcome> {
        self.set_state(SupervisorState::Stopping);
        if let Some(pid) = pid {
            process::signal_ignoring_already_exited(pid, libc::SIGTERM);
        }

        let timeout = self.config.stop_timeout();
        let kill_cancel = CancellationToken::new();
        let timer_cancel = kill_cancel.clone();
        let kill_timer = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if let Some(pid) = pid {
                        let _ = tokio::task::spawn_blocking(move || process::kill_tree(pid, KILL_GRACE)).await;
                    }
                }
                _ = timer_cancel.cancelled() => {}
            }
        });

        let _ = wait_rx.await;
        kill_cancel.cancel();
        let _ = kill_timer.await;

        if let Some(pid) = pid {
            self.instance.lock().unwrap().pid = None;
            self.monitor.drop_pid(pid);
        }

        Err(SpawnOutcome::Cancelled)
    }

    fn open_log_sink(&self) -> std::io::Result<RotatingSink> {
        let dir = self
            .config
            .log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/log/capture_supervisor"));
        let path = dir.join(format!("{}.log", sanitize_device_name(&self.config.device_name)));
        RotatingSink::open(path, 10 * 1024 * 1024, 5, true)
    }
}

enum SpawnOutcome {
    Cancelled,
    Failed(SupervisorError),
}

async fn forward_stderr_to_sink(stderr: tokio::process::ChildStderr, sink: Arc<RotatingSink>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let mut data = line.into_bytes();
                data.push(b'\n');
                let _ = sink.write(&data);
            }
            Ok(None) | Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffSettings;
    use crate::config::{Codec, InputFormat};
    use tempfile::tempdir;

    fn config(lock_dir: PathBuf, backoff: Backoff) -> SupervisorConfig {
        SupervisorConfig {
            device_name: "hw_0_0".into(),
            capture_source_id: "hw:0,0".into(),
            input_format: InputFormat::Alsa,
            stream_name: "mystream".into(),
            sample_rate: 48_000,
            channels: 2,
            bitrate: "128k".into(),
            codec: Codec::Opus,
            thread_queue: None,
            output_url: "/dev/null".into(),
            output_format: None,
            lock_dir,
            child_binary_path: "/bin/false".into(),
            backoff: Some(backoff),
            log_dir: None,
            monitor_interval: None,
            stop_timeout: Some(Duration::from_millis(200)),
            local_record_dir: None,
            segment_duration_seconds: None,
            segment_format: None,
        }
    }

    #[test]
    fn new_rejects_a_config_without_required_fields() {
        let dir = tempdir().unwrap();
        let mut cfg = config(
            dir.path().to_path_buf(),
            Backoff::new(BackoffSettings::default()),
        );
        cfg.device_name.clear();
        assert!(Supervisor::new(cfg).is_err());
    }

    #[test]
    fn fresh_supervisor_reports_idle_with_zero_counters() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path().to_path_buf(), Backoff::new(BackoffSettings::default()));
        let supervisor = Supervisor::new(cfg).unwrap();
        let snap = supervisor.metrics();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(snap.current_child_started_at_unix, 0);
        assert_eq!(snap.total_attempts, 0);
    }

    #[tokio::test]
    async fn exhausts_attempts_against_a_binary_that_always_fails() {
        // Scenario seed 4: /bin/false with a tiny backoff must exhaust
        // attempts and release the device lock.
        let dir = tempdir().unwrap();
        let backoff = Backoff::new(BackoffSettings {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            success_threshold: Duration::from_secs(3600),
            max_attempts: 3,
        });
        let cfg = config(dir.path().to_path_buf(), backoff);
        let supervisor = Supervisor::new(cfg).unwrap();

        let cancel = CancellationToken::new();
        let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run(cancel)).await;

        let result = result.expect("supervisor should give up within 5s");
        assert!(matches!(
            result,
            Err(SupervisorError::AttemptsExhausted { .. })
        ));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }
}
