//! Host-wide exclusive file lock with stale-holder detection (spec 4.2).
//!
//! The OS advisory lock on the file descriptor is authoritative; the PID
//! written into the file is advisory metadata used only to detect a
//! holder that died without releasing the lock. File mtime is never used
//! as staleness evidence, because a live long-running child leaves an old
//! mtime behind.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::fcntl::{flock, FlockArg};
use tokio_util::sync::CancellationToken;

use crate::error::LockError;
use crate::process::is_pid_active;

/// Poll interval while spinning on a contended lock (spec 4.2 step 4).
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A host-wide exclusive lock keyed by path, e.g.
/// `<lockDir>/<deviceName>.lock`.
pub struct DeviceLock {
    path: PathBuf,
    file: Option<File>,
}

impl DeviceLock {
    /// Validates `path` is non-empty and ensures its parent directory
    /// exists with mode `0755`. Does not touch the lock file itself.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(LockError::InvalidPath);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(LockError::DirectoryCreation)?;
                let mut perms = fs::metadata(parent)
                    .map_err(LockError::DirectoryCreation)?
                    .permissions();
                perms.set_mode(0o755);
                fs::set_permissions(parent, perms).map_err(LockError::DirectoryCreation)?;
            }
        }
        Ok(Self { path, file: None })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs the full acquisition protocol from spec 4.2: stale-holder
    /// detection, non-blocking `flock` attempts polled at 100ms, writing
    /// our own PID into the file on success.
    pub async fn acquire(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), LockError> {
        self.detect_and_clear_stale_holder();

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o644)
            .open(&self.path)
            .map_err(LockError::Open)?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }

            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => break,
                Err(_) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(LockError::Timeout);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = cancel.cancelled() => return Err(LockError::Cancelled),
                    }
                }
            }
        }

        self.write_pid(&file)?;
        self.file = Some(file);
        Ok(())
    }

    fn write_pid(&self, file: &File) -> Result<(), LockError> {
        let mut file = file.try_clone().map_err(LockError::Io)?;
        file.set_len(0).map_err(LockError::Io)?;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0)).map_err(LockError::Io)?;
        writeln!(file, "{}", std::process::id()).map_err(LockError::Io)?;
        file.flush().map_err(LockError::Io)?;
        file.sync_all().map_err(LockError::Io)?;
        Ok(())
    }

    /// Step 1 of spec 4.2: if a lock file exists, read its PID. An
    /// unparsable/empty PID, or a PID that fails the liveness probe,
    /// means the holder is stale and the file is best-effort unlinked.
    /// A live holder is never treated as stale, regardless of file age.
    fn detect_and_clear_stale_holder(&self) {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return,
        };

        let stale = match contents.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => !is_pid_active(pid).unwrap_or(false),
            _ => true,
        };

        if stale {
            let _ = fs::remove_file(&self.path);
        }
    }

    /// Releases the advisory lock and closes the descriptor. Fails if the
    /// lock was never acquired or has already been released.
    pub fn release(&mut self) -> Result<(), LockError> {
        let file = self.file.take().ok_or(LockError::NotHeld)?;
        flock(file.as_raw_fd(), FlockArg::Unlock).map_err(|e| {
            LockError::Io(std::io::Error::from_raw_os_error(e as i32))
        })?;
        drop(file);
        Ok(())
    }

    /// Idempotent: releases first if still held, otherwise a no-op.
    pub fn close(&mut self) {
        if self.file.is_some() {
            let _ = self.release();
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[tokio::test]
    async fn acquire_then_release_allows_a_fresh_acquire() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.lock");

        let mut lock = DeviceLock::new(&path).unwrap();
        lock.acquire(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        lock.release().unwrap();

        let mut lock2 = DeviceLock::new(&path).unwrap();
        lock2
            .acquire(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_holder_with_dead_pid_is_reclaimed() {
        // Scenario seed 2: pre-create a lock file with a PID that does
        // not exist and an old mtime; acquire must succeed and rewrite
        // the file with our own PID.
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.lock");
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, "99999").unwrap();
        }

        let mut lock = DeviceLock::new(&path).unwrap();
        lock.acquire(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[tokio::test]
    async fn live_holder_pid_is_never_stale_regardless_of_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.lock");
        {
            let mut f = File::create(&path).unwrap();
            // PID 1 (init) is essentially always alive in any Linux
            // container this test runs in.
            writeln!(f, "1").unwrap();
        }

        let lock = DeviceLock::new(&path).unwrap();
        lock.detect_and_clear_stale_holder();
        assert!(path.exists(), "a live holder's lock file must survive");
    }

    #[tokio::test]
    async fn contended_lock_times_out_within_expected_window() {
        // Scenario seed 3: lock1 acquires; lock2 with a 1s timeout must
        // fail within [0.9s, 2.0s].
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.lock");

        let mut lock1 = DeviceLock::new(&path).unwrap();
        lock1
            .acquire(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        let mut lock2 = DeviceLock::new(&path).unwrap();
        let start = std::time::Instant::now();
        let result = lock2
            .acquire(Duration::from_secs(1), &CancellationToken::new())
            .await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(LockError::Timeout)));
        assert!(elapsed >= Duration::from_millis(900));
        assert!(elapsed <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancellation_returns_immediately_even_before_timeout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.lock");

        let mut lock1 = DeviceLock::new(&path).unwrap();
        lock1
            .acquire(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        let mut lock2 = DeviceLock::new(&path).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let start = std::time::Instant::now();
        let result = lock2.acquire(Duration::from_secs(30), &token).await;
        assert!(matches!(result, Err(LockError::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn release_is_not_idempotent_but_close_is() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.lock");
        let mut lock = DeviceLock::new(&path).unwrap();
        lock.acquire(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        lock.release().unwrap();
        assert!(lock.release().is_err());

        lock.close();
        lock.close();
    }

    #[test]
    fn new_rejects_empty_path() {
        assert!(matches!(DeviceLock::new(""), Err(LockError::InvalidPath)));
    }
}
