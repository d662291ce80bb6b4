//! Cross-process advisory file locking.
//!
//! A [`FileLock`] guards a path by locking a sibling `<path>.lock` file.
//! Exclusive locks block everyone else, shared locks only block exclusive
//! acquirers. Acquisition comes in three flavours: blocking, non-blocking
//! (`try_*`, returns [`LockError::Busy`]) and deadline-bounded (`*_with_timeout`,
//! returns [`LockError::Timeout`]).
//!
//! Within one process an instance also holds a local guard for as long as the
//! OS lock is held, so threads sharing an instance are serialized and
//! [`FileLock::unlock`] only ever releases a lock this instance acquired.

mod sys;

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

pub use sys::LockMode;
use sys::{AcquireError, LockBackend, OsLock};

/// First sleep between polls in timeout mode.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Ceiling for the doubling backoff.
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Errors from lock acquisition and release.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock is held elsewhere (non-blocking acquisition).
    #[error("lock is busy")]
    Busy,

    /// The lock could not be acquired before the deadline.
    #[error("timed out after {0:?} waiting for lock")]
    Timeout(Duration),

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
struct LocalState {
    /// Reserved by a caller in this process (possibly still acquiring the OS lock).
    held: bool,
    os: Option<OsLock>,
}

/// Path-addressed advisory lock.
pub struct FileLock {
    lock_path: PathBuf,
    state: Mutex<LocalState>,
    released: Condvar,
}

impl FileLock {
    /// Create a lock guarding `path`. Nothing is touched on disk until acquisition.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut lock_path = OsString::from(path.as_ref().as_os_str());
        lock_path.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_path),
            state: Mutex::new(LocalState::default()),
            released: Condvar::new(),
        }
    }

    /// Path of the lock file itself.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Whether this instance currently holds the OS lock.
    pub fn is_locked(&self) -> bool {
        self.local().os.is_some()
    }

    /// Acquire an exclusive lock, blocking until available.
    pub fn lock(&self) -> Result<(), LockError> {
        self.acquire_blocking(LockMode::Exclusive)
    }

    /// Acquire a shared lock, blocking until available.
    pub fn lock_shared(&self) -> Result<(), LockError> {
        self.acquire_blocking(LockMode::Shared)
    }

    /// Try to acquire an exclusive lock without blocking.
    pub fn try_lock(&self) -> Result<(), LockError> {
        self.acquire_nonblocking(LockMode::Exclusive)
    }

    /// Try to acquire a shared lock without blocking.
    pub fn try_lock_shared(&self) -> Result<(), LockError> {
        self.acquire_nonblocking(LockMode::Shared)
    }

    /// Acquire an exclusive lock, giving up once `timeout` has elapsed.
    pub fn lock_with_timeout(&self, timeout: Duration) -> Result<(), LockError> {
        self.acquire_with_timeout(LockMode::Exclusive, timeout)
    }

    /// Acquire a shared lock, giving up once `timeout` has elapsed.
    pub fn lock_shared_with_timeout(&self, timeout: Duration) -> Result<(), LockError> {
        self.acquire_with_timeout(LockMode::Shared, timeout)
    }

    /// Release the lock. Unlocking an instance that holds nothing is a no-op.
    pub fn unlock(&self) -> Result<(), LockError> {
        let mut state = self.local();
        let Some(os_lock) = state.os.take() else {
            return Ok(());
        };

        let result = match os_lock.release() {
            Ok(file) => {
                drop(file);
                self.remove_if_unused();
                Ok(())
            }
            Err(e) => Err(LockError::Io(e)),
        };

        state.held = false;
        drop(state);
        self.released.notify_one();
        debug!(path = %self.lock_path.display(), "Lock released");
        result
    }

    /// Run `f` under an exclusive lock. The lock is released on every exit path.
    pub fn with_lock<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<LockError>,
    {
        self.lock()?;
        self.scoped(f)
    }

    /// Run `f` under a shared lock. The lock is released on every exit path.
    pub fn with_lock_shared<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<LockError>,
    {
        self.lock_shared()?;
        self.scoped(f)
    }

    /// [`FileLock::with_lock`] with bounded acquisition.
    pub fn with_lock_timeout<T, E>(
        &self,
        timeout: Duration,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<LockError>,
    {
        self.lock_with_timeout(timeout)?;
        self.scoped(f)
    }

    /// [`FileLock::with_lock_shared`] with bounded acquisition.
    pub fn with_lock_shared_timeout<T, E>(
        &self,
        timeout: Duration,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<LockError>,
    {
        self.lock_shared_with_timeout(timeout)?;
        self.scoped(f)
    }

    fn scoped<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let _release = ReleaseOnDrop(self);
        f()
    }

    fn acquire_blocking(&self, mode: LockMode) -> Result<(), LockError> {
        let mut state = self.local();
        while state.held {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.held = true;
        drop(state);

        let result = self.open_and_lock(mode, true);
        self.finish(result, mode)
    }

    fn acquire_nonblocking(&self, mode: LockMode) -> Result<(), LockError> {
        let mut state = self.local();
        if state.held {
            return Err(LockError::Busy);
        }
        state.held = true;
        drop(state);

        let result = self.open_and_lock(mode, false);
        self.finish(result, mode)
    }

    fn acquire_with_timeout(&self, mode: LockMode, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;

        let mut state = self.local();
        while state.held {
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout(timeout));
            }
            state = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.held = true;
        drop(state);

        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.open_and_lock(mode, false) {
                Err(LockError::Busy) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.finish(Err(LockError::Timeout(timeout)), mode);
                    }
                    std::thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                other => return self.finish(other, mode),
            }
        }
    }

    /// Store a freshly acquired OS lock, or drop the local reservation on failure.
    fn finish(&self, result: Result<OsLock, LockError>, mode: LockMode) -> Result<(), LockError> {
        let mut state = self.local();
        match result {
            Ok(os_lock) => {
                state.os = Some(os_lock);
                debug!(path = %self.lock_path.display(), ?mode, "Lock acquired");
                Ok(())
            }
            Err(e) => {
                state.held = false;
                drop(state);
                self.released.notify_one();
                Err(e)
            }
        }
    }

    fn open_and_lock(&self, mode: LockMode, wait: bool) -> Result<OsLock, LockError> {
        loop {
            let file = self.open_lock_file()?;
            let os_lock = match OsLock::acquire(file, mode, wait) {
                Ok(os_lock) => os_lock,
                Err(AcquireError::WouldBlock) => return Err(LockError::Busy),
                Err(AcquireError::Io(e)) => return Err(LockError::Io(e)),
            };

            if sys::is_current(os_lock.file(), &self.lock_path) {
                return Ok(os_lock);
            }
            // The previous holder removed the file while we waited; lock the new one.
            drop(os_lock.release());
        }
    }

    fn open_lock_file(&self) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
    }

    /// Best-effort removal of the lock file once nobody else holds it.
    fn remove_if_unused(&self) {
        let Ok(file) = self.open_lock_file() else {
            return;
        };
        match OsLock::acquire(file, LockMode::Exclusive, false) {
            Ok(held) => {
                if let Err(e) = std::fs::remove_file(&self.lock_path) {
                    debug!(path = %self.lock_path.display(), error = %e, "Lock file not removed");
                }
                drop(held.release());
            }
            Err(_) => {
                debug!(path = %self.lock_path.display(), "Lock file still in use, keeping it");
            }
        }
    }

    fn local(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock")
            .field("lock_path", &self.lock_path)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!(path = %self.lock_path.display(), error = %e, "Failed to release lock on drop");
        }
    }
}

struct ReleaseOnDrop<'a>(&'a FileLock);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.unlock() {
            warn!(path = %self.0.lock_path.display(), error = %e, "Failed to release lock");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn target(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("sessions.json")
    }

    #[test]
    fn lock_file_sits_next_to_target() {
        let lock = FileLock::new("/tmp/state.json");
        assert_eq!(lock.lock_path(), Path::new("/tmp/state.json.lock"));
    }

    #[test]
    fn exclusive_blocks_second_exclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = FileLock::new(target(&dir));
        let b = FileLock::new(target(&dir));

        a.lock().unwrap();
        assert!(matches!(b.try_lock(), Err(LockError::Busy)));
        a.unlock().unwrap();
        b.try_lock().unwrap();
        b.unlock().unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = FileLock::new(target(&dir));
        let b = FileLock::new(target(&dir));

        a.lock_shared().unwrap();
        b.try_lock_shared().unwrap();
        assert!(a.is_locked());
        assert!(b.is_locked());
        a.unlock().unwrap();
        b.unlock().unwrap();
    }

    #[test]
    fn exclusive_and_shared_exclude_each_other() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = FileLock::new(target(&dir));
        let b = FileLock::new(target(&dir));

        a.lock().unwrap();
        assert!(matches!(b.try_lock_shared(), Err(LockError::Busy)));
        a.unlock().unwrap();

        b.lock_shared().unwrap();
        assert!(matches!(a.try_lock(), Err(LockError::Busy)));
        b.unlock().unwrap();
    }

    #[test]
    fn timeout_never_returns_early() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = FileLock::new(target(&dir));
        let b = FileLock::new(target(&dir));
        a.lock().unwrap();

        let wait = Duration::from_millis(150);
        let started = Instant::now();
        let result = b.lock_with_timeout(wait);
        assert!(matches!(result, Err(LockError::Timeout(d)) if d == wait));
        assert!(started.elapsed() >= wait);
        assert!(!b.is_locked());
    }

    #[test]
    fn timeout_acquires_once_released() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = Arc::new(FileLock::new(target(&dir)));
        let b = FileLock::new(target(&dir));
        a.lock().unwrap();

        let holder = Arc::clone(&a);
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            holder.unlock().unwrap();
        });

        b.lock_with_timeout(Duration::from_secs(5)).unwrap();
        assert!(b.is_locked());
        releaser.join().unwrap();
        b.unlock().unwrap();
    }

    #[test]
    fn unlock_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = FileLock::new(target(&dir));

        lock.unlock().unwrap();
        assert!(!lock.lock_path().exists());

        lock.lock().unwrap();
        lock.unlock().unwrap();
        lock.unlock().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn unlock_removes_lock_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = FileLock::new(target(&dir));

        lock.lock().unwrap();
        assert!(lock.lock_path().exists());
        lock.unlock().unwrap();
        assert!(!lock.lock_path().exists());
    }

    #[test]
    fn shared_holder_keeps_lock_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = FileLock::new(target(&dir));
        let b = FileLock::new(target(&dir));

        a.lock_shared().unwrap();
        b.lock_shared().unwrap();
        a.unlock().unwrap();
        assert!(b.lock_path().exists());

        let c = FileLock::new(target(&dir));
        assert!(matches!(c.try_lock(), Err(LockError::Busy)));
        b.unlock().unwrap();
    }

    #[test]
    fn with_lock_releases_after_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = FileLock::new(target(&dir));
        let b = FileLock::new(target(&dir));

        let result: Result<(), LockError> = a.with_lock(|| {
            assert!(matches!(b.try_lock(), Err(LockError::Busy)));
            Err(LockError::Io(std::io::Error::other("boom")))
        });
        assert!(matches!(result, Err(LockError::Io(_))));
        assert!(!a.is_locked());
        b.try_lock().unwrap();
        b.unlock().unwrap();
    }

    #[test]
    fn with_lock_returns_closure_value() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = FileLock::new(target(&dir));
        let value: Result<u32, LockError> = lock.with_lock_shared(|| Ok(42));
        assert_eq!(value.unwrap(), 42);
        assert!(!lock.is_locked());
    }

    #[test]
    fn blocking_lock_waits_for_release() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = Arc::new(FileLock::new(target(&dir)));
        a.lock().unwrap();

        let holder = Arc::clone(&a);
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            holder.unlock().unwrap();
        });

        let b = FileLock::new(target(&dir));
        let started = Instant::now();
        b.lock().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
        b.unlock().unwrap();
        releaser.join().unwrap();
    }

    #[test]
    fn same_instance_serializes_threads() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = Arc::new(FileLock::new(target(&dir)));
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let entered = Arc::clone(&entered);
                std::thread::spawn(move || {
                    let result: Result<(), LockError> = lock.with_lock(|| {
                        assert!(!inside.swap(true, Ordering::SeqCst), "overlapping holders");
                        std::thread::sleep(Duration::from_millis(20));
                        inside.store(false, Ordering::SeqCst);
                        entered.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    result.unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn try_lock_on_held_instance_is_busy() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = FileLock::new(target(&dir));
        lock.lock().unwrap();
        assert!(matches!(lock.try_lock(), Err(LockError::Busy)));
        lock.unlock().unwrap();
    }
}
