//! Periodic per-process resource sampler and threshold alerting
//! (spec section 4.4).
//!
//! Everything is read directly from a `/proc`-shaped pseudo-filesystem
//! rooted at a configurable path so tests can point the monitor at a
//! fixture directory instead of the real `/proc`. The teacher's own
//! `resource_monitor.rs` already hand-parses `/proc/uptime` with plain
//! `std::fs::File`; this module follows that idiom for every file spec
//! section 6 names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::logger::LogLevel;
use crate::log;

/// Default root of the process-info pseudo-filesystem.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// One sample of a process's resource footprint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub pid: i32,
    pub captured_at: std::time::SystemTime,
    pub fd_count: u32,
    pub thread_count: u32,
    pub resident_bytes: u64,
    /// `None` when CPU usage cannot yet be computed (no prior sample).
    pub cpu_percent: Option<f32>,
    /// `None` when the process start time could not be determined.
    pub uptime: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertResource {
    Fd,
    Cpu,
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub level: AlertLevel,
    pub resource: AlertResource,
    pub message: String,
    pub raw_value: f64,
}

/// Warning/critical thresholds per resource. Defaults from spec 4.4: FD
/// 500/1000, CPU 20%/40%, memory 512MiB/1GiB.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub fd_warning: u32,
    pub fd_critical: u32,
    pub cpu_warning: f32,
    pub cpu_critical: f32,
    pub memory_warning: u64,
    pub memory_critical: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            fd_warning: 500,
            fd_critical: 1000,
            cpu_warning: 20.0,
            cpu_critical: 40.0,
            memory_warning: 512 * 1024 * 1024,
            memory_critical: 1024 * 1024 * 1024,
        }
    }
}

/// Maps a sample to zero or more alerts under the configured thresholds.
pub fn evaluate(sample: &ResourceSample, thresholds: &Thresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if sample.fd_count >= thresholds.fd_critical {
        alerts.push(Alert {
            level: AlertLevel::Critical,
            resource: AlertResource::Fd,
            message: format!("fd count {} >= critical {}", sample.fd_count, thresholds.fd_critical),
            raw_value: sample.fd_count as f64,
        });
    } else if sample.fd_count >= thresholds.fd_warning {
        alerts.push(Alert {
            level: AlertLevel::Warning,
            resource: AlertResource::Fd,
            message: format!("fd count {} >= warning {}", sample.fd_count, thresholds.fd_warning),
            raw_value: sample.fd_count as f64,
        });
    }

    if let Some(cpu) = sample.cpu_percent {
        if cpu >= thresholds.cpu_critical {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                resource: AlertResource::Cpu,
                message: format!("cpu {:.1}% >= critical {:.1}%", cpu, thresholds.cpu_critical),
                raw_value: cpu as f64,
            });
        } else if cpu >= thresholds.cpu_warning {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                resource: AlertResource::Cpu,
                message: format!("cpu {:.1}% >= warning {:.1}%", cpu, thresholds.cpu_warning),
                raw_value: cpu as f64,
            });
        }
    }

    if sample.resident_bytes >= thresholds.memory_critical {
        alerts.push(Alert {
            level: AlertLevel::Critical,
            resource: AlertResource::Memory,
            message: format!(
                "resident memory {} >= critical {}",
                sample.resident_bytes, thresholds.memory_critical
            ),
            raw_value: sample.resident_bytes as f64,
        });
    } else if sample.resident_bytes >= thresholds.memory_warning {
        alerts.push(Alert {
            level: AlertLevel::Warning,
            resource: AlertResource::Memory,
            message: format!(
                "resident memory {} >= warning {}",
                sample.resident_bytes, thresholds.memory_warning
            ),
            raw_value: sample.resident_bytes as f64,
        });
    }

    alerts
}

/// Raised when a sample cannot be taken, typically because the process
/// has exited.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("process {0} not found")]
    NotFound(i32),
    #[error("failed to read process info: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed process info: {0}")]
    Parse(String),
}

struct CpuBaseline {
    total_ticks: u64,
    sampled_at: std::time::Instant,
}

/// Samples a single PID's resource footprint from a process-info
/// filesystem rooted at `proc_root`.
pub struct Sampler {
    proc_root: PathBuf,
    clock_ticks_per_second: u64,
    cpu_baselines: Mutex<HashMap<i32, CpuBaseline>>,
}

impl Sampler {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            clock_ticks_per_second: clock_ticks_per_second(),
            cpu_baselines: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_root() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }

    /// Takes one sample of `pid`.
    pub fn sample(&self, pid: i32) -> Result<ResourceSample, SampleError> {
        let pid_dir = self.proc_root.join(pid.to_string());
        if !pid_dir.is_dir() {
            return Err(SampleError::NotFound(pid));
        }

        let fd_count = count_fd_entries(&pid_dir)?;
        let stat_contents = std::fs::read_to_string(pid_dir.join("stat"))?;
        let (thread_count, utime, stime, starttime) = parse_stat(&stat_contents)?;
        let statm_contents = std::fs::read_to_string(pid_dir.join("statm"))?;
        let resident_pages = parse_statm_resident(&statm_contents)?;
        let page_size = page_size_bytes();
        let resident_bytes = resident_pages * page_size;

        let total_ticks = utime + stime;
        let cpu_percent = self.cpu_percent_since_last_sample(pid, total_ticks);

        let uptime = self.boot_time().ok().map(|boot_time| {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            let start_secs = starttime as f64 / self.clock_ticks_per_second as f64;
            let elapsed = now - boot_time as f64 - start_secs;
            Duration::from_secs_f64(elapsed.max(0.0))
        });

        Ok(ResourceSample {
            pid,
            captured_at: std::time::SystemTime::now(),
            fd_count,
            thread_count,
            resident_bytes,
            cpu_percent,
            uptime,
        })
    }

    fn cpu_percent_since_last_sample(&self, pid: i32, total_ticks: u64) -> Option<f32> {
        let mut baselines = self.cpu_baselines.lock().unwrap();
        let now = std::time::Instant::now();
        let percent = match baselines.get(&pid) {
            Some(prev) => {
                let tick_delta = total_ticks.saturating_sub(prev.total_ticks) as f64;
                let wall_delta = now.duration_since(prev.sampled_at).as_secs_f64();
                if wall_delta > 0.0 {
                    Some(((tick_delta / self.clock_ticks_per_second as f64) / wall_delta * 100.0) as f32)
                } else {
                    None
                }
            }
            // Open question (a): no prior sample means we can't compute a
            // delta yet; report zero rather than a misleading instantaneous
            // figure.
            None => Some(0.0),
        };
        baselines.insert(
            pid,
            CpuBaseline {
                total_ticks,
                sampled_at: now,
            },
        );
        percent
    }

    fn boot_time(&self) -> std::io::Result<u64> {
        let contents = std::fs::read_to_string(self.proc_root.join("stat"))?;
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("btime ") {
                if let Ok(v) = rest.trim().parse::<u64>() {
                    return Ok(v);
                }
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "btime not found",
        ))
    }

    /// Drops the cached sample/baseline for a PID that has exited.
    pub fn forget(&self, pid: i32) {
        self.cpu_baselines.lock().unwrap().remove(&pid);
    }

    /// Reads `<root>/sys/fs/file-nr`: returns `(current_allocated,
    /// system_max)`.
    pub fn global_fd_usage(&self) -> std::io::Result<(u64, u64)> {
        let contents = std::fs::read_to_string(self.proc_root.join("sys/fs/file-nr"))?;
        let mut fields = contents.split_whitespace();
        let allocated = fields
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "file-nr"))?;
        let max = fields
            .nth(1)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "file-nr"))?;
        Ok((allocated, max))
    }
}

fn count_fd_entries(pid_dir: &Path) -> std::io::Result<u32> {
    let mut count = 0u32;
    for entry in std::fs::read_dir(pid_dir.join("fd"))? {
        entry?;
        count += 1;
    }
    Ok(count)
}

/// Parses `/proc/<pid>/stat`. The comm field may itself contain
/// parentheses, so `num_threads` (and the other fields after the comm)
/// must be located relative to the *last* `)` in the line, not the first.
fn parse_stat(contents: &str) -> Result<(u32, u64, u64, u64), SampleError> {
    let last_paren = contents
        .rfind(')')
        .ok_or_else(|| SampleError::Parse("no ')' in stat".into()))?;
    let rest = &contents[last_paren + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // Fields after `pid (comm) state` are 1-indexed starting at `ppid`
    // (field 4 overall); `rest` begins at field 3 (`state`).
    let field = |idx_from_state: usize| -> Result<&str, SampleError> {
        fields
            .get(idx_from_state)
            .copied()
            .ok_or_else(|| SampleError::Parse(format!("missing stat field {idx_from_state}")))
    };

    // Overall field numbers (man proc(5)): 14 utime, 15 stime, 22
    // starttime, 20 num_threads. `state` is field 3, so offset by 3.
    let utime: u64 = field(14 - 3)?.parse().map_err(|_| SampleError::Parse("utime".into()))?;
    let stime: u64 = field(15 - 3)?.parse().map_err(|_| SampleError::Parse("stime".into()))?;
    let num_threads: u32 = field(20 - 3)?
        .parse()
        .map_err(|_| SampleError::Parse("num_threads".into()))?;
    let starttime: u64 = field(22 - 3)?
        .parse()
        .map_err(|_| SampleError::Parse("starttime".into()))?;

    Ok((num_threads, utime, stime, starttime))
}

/// Parses `/proc/<pid>/statm`. The *second* field is RSS in pages; the
/// first is virtual size and must not be used.
fn parse_statm_resident(contents: &str) -> Result<u64, SampleError> {
    let mut fields = contents.split_whitespace();
    fields.next(); // virtual size, unused
    fields
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| SampleError::Parse("missing resident field in statm".into()))
}

fn clock_ticks_per_second() -> u64 {
    #[cfg(unix)]
    {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            return ticks as u64;
        }
    }
    100
}

fn page_size_bytes() -> u64 {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as u64;
        }
    }
    4096
}

/// Holds the most recent sample per PID for fast read-side queries, and
/// drives the periodic sample/evaluate/alert loop (spec 4.4, "Monitor
/// loop").
pub struct ResourceMonitor {
    sampler: Sampler,
    thresholds: Thresholds,
    latest: Mutex<HashMap<i32, ResourceSample>>,
}

/// Receives alerts produced by a running [`ResourceMonitor`] loop.
pub trait AlertSink: Send + Sync {
    fn on_alerts(&self, pid: i32, alerts: &[Alert]);
}

impl ResourceMonitor {
    pub fn new(proc_root: impl Into<PathBuf>, thresholds: Thresholds) -> Self {
        Self {
            sampler: Sampler::new(proc_root),
            thresholds,
            latest: Mutex::new(HashMap::new()),
        }
    }

    pub fn latest_for(&self, pid: i32) -> Option<ResourceSample> {
        self.latest.lock().unwrap().get(&pid).copied()
    }

    pub fn drop_pid(&self, pid: i32) {
        self.latest.lock().unwrap().remove(&pid);
        self.sampler.forget(pid);
    }

    /// Ticks every `interval`, sampling `pid`. Exits the loop as soon as
    /// the process is gone (after logging once) or `cancel` fires.
    pub async fn run_loop(
        &self,
        pid: i32,
        interval: Duration,
        alert_sink: Option<&dyn AlertSink>,
        cancel: &CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sampler.sample(pid) {
                Ok(sample) => {
                    self.latest.lock().unwrap().insert(pid, sample);
                    let alerts = evaluate(&sample, &self.thresholds);
                    if !alerts.is_empty() {
                        if let Some(sink) = alert_sink {
                            sink.on_alerts(pid, &alerts);
                        }
                    }
                }
                Err(e) => {
                    log!(LogLevel::Debug, "Resource monitor for pid {} stopping: {}", pid, e);
                    break;
                }
            }
        }
        self.drop_pid(pid);
    }

    pub fn global_fd_usage(&self) -> std::io::Result<(u64, u64)> {
        self.sampler.global_fd_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    fn write_fake_process(root: &Path, pid: i32, num_threads: u32, fd_count: u32, resident_pages: u64) {
        let pid_dir = root.join(pid.to_string());
        std::fs::create_dir_all(pid_dir.join("fd")).unwrap();
        for i in 0..fd_count {
            std::fs::write(pid_dir.join("fd").join(i.to_string()), "").unwrap();
        }

        // comm field deliberately contains parentheses to exercise the
        // "last )" parsing rule.
        let stat = format!(
            "{pid} (my (weird) proc) S 1 1 1 0 -1 4194304 0 0 0 0 10 20 0 0 20 0 {nt} 0 1000 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0\n",
            pid = pid,
            nt = num_threads,
        );
        std::fs::write(pid_dir.join("stat"), stat).unwrap();
        std::fs::write(
            pid_dir.join("statm"),
            format!("9999 {resident_pages} 0 0 0 0 0\n"),
        )
        .unwrap();
    }

    fn write_global_proc_files(root: &Path) {
        std::fs::write(root.join("stat"), "btime 1000000000\n").unwrap();
        std::fs::create_dir_all(root.join("sys/fs")).unwrap();
        std::fs::write(root.join("sys/fs/file-nr"), "123\t0\t4096\n").unwrap();
    }

    #[test]
    fn parses_comm_field_with_embedded_parentheses() {
        let dir = tempdir().unwrap();
        write_fake_process(dir.path(), 42, 7, 3, 1000);
        write_global_proc_files(dir.path());

        let sampler = Sampler::new(dir.path());
        let sample = sampler.sample(42).unwrap();
        assert_eq!(sample.thread_count, 7);
        assert_eq!(sample.fd_count, 3);
    }

    #[test]
    fn resident_memory_uses_second_statm_field_not_first() {
        let dir = tempdir().unwrap();
        write_fake_process(dir.path(), 42, 1, 0, 256);
        write_global_proc_files(dir.path());

        let sampler = Sampler::new(dir.path());
        let sample = sampler.sample(42).unwrap();
        assert_eq!(sample.resident_bytes, 256 * page_size_bytes());
    }

    #[test]
    fn sample_of_missing_process_errors() {
        let dir = tempdir().unwrap();
        let sampler = Sampler::new(dir.path());
        assert!(matches!(sampler.sample(424242), Err(SampleError::NotFound(_))));
    }

    #[test]
    fn global_fd_usage_reads_file_nr() {
        let dir = tempdir().unwrap();
        write_global_proc_files(dir.path());
        let sampler = Sampler::new(dir.path());
        let (current, max) = sampler.global_fd_usage().unwrap();
        assert_eq!(current, 123);
        assert_eq!(max, 4096);
    }

    #[test]
    fn fd_threshold_crosses_produce_correct_level_only() {
        let sample = ResourceSample {
            pid: 1,
            captured_at: std::time::SystemTime::now(),
            fd_count: 1500,
            thread_count: 1,
            resident_bytes: 0,
            cpu_percent: Some(0.0),
            uptime: None,
        };
        let alerts = evaluate(&sample, &Thresholds::default());
        let fd_alerts: Vec<_> = alerts.iter().filter(|a| a.resource == AlertResource::Fd).collect();
        assert_eq!(fd_alerts.len(), 1);
        assert_eq!(fd_alerts[0].level, AlertLevel::Critical);
    }

    #[test]
    fn cpu_and_memory_thresholds_are_symmetric_with_fd() {
        let sample = ResourceSample {
            pid: 1,
            captured_at: std::time::SystemTime::now(),
            fd_count: 0,
            thread_count: 1,
            resident_bytes: 2 * 1024 * 1024 * 1024,
            cpu_percent: Some(50.0),
            uptime: None,
        };
        let alerts = evaluate(&sample, &Thresholds::default());
        let cpu: Vec<_> = alerts.iter().filter(|a| a.resource == AlertResource::Cpu).collect();
        let mem: Vec<_> = alerts.iter().filter(|a| a.resource == AlertResource::Memory).collect();
        assert_eq!(cpu.len(), 1);
        assert_eq!(cpu[0].level, AlertLevel::Critical);
        assert_eq!(mem.len(), 1);
        assert_eq!(mem[0].level, AlertLevel::Critical);
    }

    struct RecordingSink {
        seen: StdMutex<Vec<Alert>>,
    }

    impl AlertSink for RecordingSink {
        fn on_alerts(&self, _pid: i32, alerts: &[Alert]) {
            self.seen.lock().unwrap().extend_from_slice(alerts);
        }
    }

    #[tokio::test]
    async fn monitor_loop_alerts_on_excessive_fd_count_within_window() {
        // Scenario seed 7: 600 fd entries, default thresholds, 50ms
        // poll; within 150ms the sink must see a warning fd alert.
        let dir = tempdir().unwrap();
        write_fake_process(dir.path(), 777, 1, 600, 10);
        write_global_proc_files(dir.path());

        let monitor = ResourceMonitor::new(dir.path(), Thresholds::default());
        let sink = RecordingSink {
            seen: StdMutex::new(Vec::new()),
        };
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let handle = tokio::spawn(async move {
            monitor
                .run_loop(777, Duration::from_millis(50), Some(&sink), &cancel_clone)
                .await;
            sink
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let sink = handle.await.unwrap();

        let seen = sink.seen.lock().unwrap();
        assert!(seen
            .iter()
            .any(|a| a.resource == AlertResource::Fd && a.level == AlertLevel::Warning));
    }
}
