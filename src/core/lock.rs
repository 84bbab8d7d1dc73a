/// Advisory file locks and the single-instance PID guard

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::core::error::LockError;

/// Poll interval while waiting for a contended lock
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the PID guard waits for its own lock file
const PID_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Exclusive, kernel-level advisory lock held on an empty marker file.
///
/// The lock is released on `release()` or drop, whichever comes first.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Poll for the lock until it is acquired or `timeout` elapses
    pub fn acquire(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, LockError> {
        let path = path.into();
        let file = open_lock_file(&path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match poll(&file, &path, deadline, timeout)? {
                Some(wait) => std::thread::sleep(wait),
                None => return Ok(Self::held(path, file)),
            }
        }
    }

    /// Same as [`FileLock::acquire`], but yields to the runtime between polls
    pub async fn acquire_async(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, LockError> {
        let path = path.into();
        let file = open_lock_file(&path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match poll(&file, &path, deadline, timeout)? {
                Some(wait) => tokio::time::sleep(wait).await,
                None => return Ok(Self::held(path, file)),
            }
        }
    }

    fn held(path: PathBuf, file: File) -> Self {
        debug!(path = %path.display(), "Acquired file lock");
        Self {
            path,
            file: Some(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Unlock and close. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                debug!(path = %self.path.display(), error = %e, "Unlock failed, closing anyway");
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    let io_err = |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(io_err)
}

/// One lock attempt. `Ok(None)` means acquired, `Ok(Some(wait))` means retry after `wait`.
fn poll(file: &File, path: &Path, deadline: Instant, timeout: Duration) -> Result<Option<Duration>, LockError> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(None),
        Err(e) if is_contended(&e) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            Ok(Some(LOCK_POLL_INTERVAL.min(deadline - now)))
        }
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == IoErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// PID marker guaranteeing a single running instance.
///
/// A PID file left behind by a dead process is treated as stale and replaced.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    released: bool,
}

impl PidFile {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        // Serialize the check-and-write against other starting instances
        let _guard = FileLock::acquire(path.with_extension("lock"), PID_LOCK_TIMEOUT)?;

        match fs::read_to_string(&path) {
            Ok(contents) => {
                let recorded = contents.trim().parse::<i32>().ok();
                match recorded {
                    Some(pid) if pid != own_pid() && is_process_alive(pid) => {
                        return Err(LockError::AlreadyRunning { pid, path });
                    }
                    Some(pid) => {
                        warn!(pid, path = %path.display(), "Removing stale PID file");
                    }
                    None => {
                        warn!(path = %path.display(), "Removing unreadable PID file");
                    }
                }
                fs::remove_file(&path).map_err(io_err)?;
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(source) => return Err(LockError::Io { path, source }),
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(io_err)?;
        writeln!(file, "{}", own_pid()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        debug!(path = %path.display(), pid = own_pid(), "PID file written");
        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the PID file. Errors are ignored and a missing file is fine.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.release();
    }
}

fn own_pid() -> i32 {
    std::process::id() as i32
}

/// Zero-signal probe: true if the process exists, even if we may not signal it
#[cfg(unix)]
pub fn is_process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: i32) -> bool {
    // Without a probe, never block on a possibly stale file
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dirlist.lock");

        let mut first = FileLock::acquire(&path, Duration::from_secs(1)).unwrap();
        assert!(first.is_held());

        let err = FileLock::acquire(&path, Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        first.release();
        first.release();
        assert!(!first.is_held());

        let second = FileLock::acquire(&path, Duration::from_millis(300)).unwrap();
        assert!(second.is_held());
    }

    #[test]
    fn test_waiter_gets_lock_after_holder_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dirlist.lock");
        let holder = FileLock::acquire(&path, Duration::from_secs(1)).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let lock = FileLock::acquire(&waiter_path, Duration::from_secs(5));
            tx.send(started.elapsed()).unwrap();
            lock.map(|l| l.is_held())
        });

        thread::sleep(Duration::from_millis(400));
        drop(holder);

        let waited = rx.recv().unwrap();
        assert!(waiter.join().unwrap().unwrap());
        assert!(waited >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_async_acquire_waits_without_blocking_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.lock");

        let mut holder = FileLock::acquire(&path, Duration::from_secs(1)).unwrap();
        let err = FileLock::acquire_async(&path, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        // A sibling task on the same thread releases the lock mid-wait
        let release = async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            holder.release();
        };
        let (lock, ()) = tokio::join!(FileLock::acquire_async(&path, Duration::from_secs(5)), release);
        assert!(lock.unwrap().is_held());
    }

    #[test]
    fn test_pid_file_blocks_live_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.pid");

        // PID 1 always exists
        fs::write(&path, "1\n").unwrap();
        let err = PidFile::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { pid: 1, .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n");
    }

    #[test]
    fn test_stale_pid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.pid");

        // Beyond the default pid_max, so no such process
        fs::write(&path, "99999999\n").unwrap();
        let mut guard = PidFile::acquire(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());

        guard.release();
        assert!(!path.exists());
        guard.release();
    }

    #[test]
    fn test_garbage_pid_file_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.pid");
        fs::write(&path, "not a pid").unwrap();

        let guard = PidFile::acquire(&path).unwrap();
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_process_probe() {
        assert!(is_process_alive(std::process::id() as i32));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(99_999_999));
    }
}
