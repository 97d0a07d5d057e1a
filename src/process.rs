//! Child-process spawn and termination helpers.
//!
//! Grounded in the teacher's `process_manager.rs`: `spawn_complex_process`,
//! `kill_pgid_recursive`, `collect_descendants`, and `is_pid_active` carry
//! over near-verbatim, generalized to the `Supervisor`'s needs and with
//! `dusa_collection_utils` types replaced by `std`/`thiserror` equivalents.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::process::Stdio;
use std::time::Duration;

use libc::{c_int, kill, SIGKILL, SIGTERM};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use procfs::process::{all_processes, Process};
use tokio::process::{Child, Command};

use crate::log;
use crate::logger::LogLevel;

/// Spawns `command` in its own session (`setsid()`), capturing stdout and
/// piping stderr so the caller can attach it to a [`crate::log_sink::RotatingSink`].
///
/// Mirrors the teacher's `spawn_complex_process`, minus the resource
/// monitor wiring (the supervisor attaches a [`crate::monitor::ResourceMonitor`]
/// separately, keyed by PID, once the spawn has succeeded).
pub fn spawn_independent(command: &mut Command) -> io::Result<Child> {
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    command.stdout(Stdio::null());
    command.stderr(Stdio::piped());
    command.spawn()
}

/// Checks if a PID is active on the system by sending signal 0. Returns
/// `Ok(true)` if the process exists or we lack permission to signal it
/// (it still exists), `Ok(false)` if it is gone.
pub fn is_pid_active(pid: i32) -> io::Result<bool> {
    let ret = unsafe { kill(pid, 0) };
    if ret == 0 {
        Ok(true)
    } else {
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => Ok(false),
            Some(libc::EPERM) => Ok(true),
            Some(err) => Err(io::Error::from_raw_os_error(err)),
            None => Err(io::Error::new(io::ErrorKind::Other, "unknown error probing pid")),
        }
    }
}

/// Recursively collects all descendant PIDs of `root_pid`, including
/// itself.
fn collect_descendants(root_pid: i32) -> HashSet<i32> {
    let mut children_map: HashMap<i32, Vec<i32>> = HashMap::new();

    if let Ok(procs) = all_processes() {
        for prc in procs {
            let process: Process = match prc {
                Ok(p) => p,
                Err(_) => continue,
            };
            if let Ok(stat) = process.stat() {
                children_map.entry(stat.ppid).or_default().push(process.pid());
            }
        }
    }

    let mut result = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(root_pid);
    result.insert(root_pid);

    while let Some(pid) = queue.pop_front() {
        if let Some(children) = children_map.get(&pid) {
            for child in children {
                if result.insert(*child) {
                    queue.push_back(*child);
                }
            }
        }
    }

    result
}

fn reap_zombie(pid: c_int) {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, status)) => {
            log!(LogLevel::Trace, "Reaped pid {} with exit status {}", pid, status)
        }
        Ok(WaitStatus::Signaled(_, sig, _)) => {
            log!(LogLevel::Trace, "Reaped pid {} terminated by signal {:?}", pid, sig)
        }
        Ok(status) => log!(LogLevel::Trace, "pid {} wait status: {:?}", pid, status),
        Err(e) => log!(LogLevel::Trace, "Failed to reap pid {}: {}", pid, e),
    }
}

pub fn pid_running(pid: c_int) -> bool {
    unsafe { kill(pid, 0) == 0 }
}

/// Sends `SIGTERM` to every process in `root_pid`'s descendant set, waits
/// briefly, reaps zombies, then escalates to `SIGKILL` for anything still
/// alive. Mirrors the teacher's `kill_pgid_recursive`.
///
/// Blocks the calling thread for up to `grace` via `std::thread::sleep`;
/// callers on an async runtime must run this through
/// `tokio::task::spawn_blocking` rather than awaiting it inline.
pub fn kill_tree(root_pid: i32, grace: Duration) -> io::Result<()> {
    log!(LogLevel::Trace, "Recursively killing pid tree rooted at {}", root_pid);
    let pids = collect_descendants(root_pid);

    for pid in &pids {
        let res = unsafe { kill(*pid, SIGTERM) };
        if res != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                log!(LogLevel::Warn, "Failed to send SIGTERM to pid {}: {}", pid, err);
            }
        }
    }

    std::thread::sleep(grace);

    for pid in &pids {
        reap_zombie(*pid);
        if pid_running(*pid) {
            log!(LogLevel::Warn, "pid {} still running; sending SIGKILL", pid);
            let res = unsafe { kill(*pid, SIGKILL) };
            if res != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(err);
                }
            }
            reap_zombie(*pid);
        }
    }

    Ok(())
}

/// Sends a single signal to `pid`, swallowing the benign race where the
/// process has already exited (spec section 7: "Signal errors from
/// already-exited processes are benign and must be swallowed").
pub fn signal_ignoring_already_exited(pid: i32, signal: c_int) {
    let res = unsafe { kill(pid, signal) };
    if res != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log!(LogLevel::Warn, "Failed to signal pid {}: {}", pid, err);
        }
    }
}
