//! Platform lock primitives.
//!
//! Each platform provides one [`LockBackend`]: acquire a lock on an open file
//! (blocking or not) and release it again. Everything above this trait
//! (polling, backoff, deadlines, the in-process guard) is shared.

use std::fs::File;
use std::io;
use std::path::Path;

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Blocks every other holder.
    Exclusive,
    /// Compatible with other shared holders, blocks exclusive ones.
    Shared,
}

/// Why a primitive acquisition failed.
#[derive(Debug)]
pub(crate) enum AcquireError {
    /// Someone else holds an incompatible lock (non-blocking mode only).
    WouldBlock,
    Io(io::Error),
}

pub(crate) trait LockBackend: Sized + Send {
    /// Lock `file`. With `wait == false` contention yields [`AcquireError::WouldBlock`].
    fn acquire(file: File, mode: LockMode, wait: bool) -> Result<Self, AcquireError>;

    /// Release the lock and hand the file back.
    fn release(self) -> io::Result<File>;

    /// The locked file.
    fn file(&self) -> &File;
}

#[cfg(unix)]
mod unix {
    use super::{AcquireError, File, LockBackend, LockMode, io};
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    /// `flock(2)`-based lock. Released when dropped.
    pub struct FlockLock(Flock<File>);

    impl LockBackend for FlockLock {
        fn acquire(file: File, mode: LockMode, wait: bool) -> Result<Self, AcquireError> {
            let arg = match (mode, wait) {
                (LockMode::Exclusive, true) => FlockArg::LockExclusive,
                (LockMode::Shared, true) => FlockArg::LockShared,
                (LockMode::Exclusive, false) => FlockArg::LockExclusiveNonblock,
                (LockMode::Shared, false) => FlockArg::LockSharedNonblock,
            };

            let mut file = file;
            loop {
                match Flock::lock(file, arg) {
                    Ok(lock) => return Ok(Self(lock)),
                    // Interrupted by a signal handler, try again.
                    Err((returned, Errno::EINTR)) => file = returned,
                    Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                        return Err(AcquireError::WouldBlock);
                    }
                    Err((_, errno)) => return Err(AcquireError::Io(io::Error::from(errno))),
                }
            }
        }

        fn release(self) -> io::Result<File> {
            self.0
                .unlock()
                .map_err(|(_, errno)| io::Error::from(errno))
        }

        fn file(&self) -> &File {
            &self.0
        }
    }
}

#[cfg(not(unix))]
mod portable {
    use super::{AcquireError, File, LockBackend, LockMode, io};

    /// `fs2`-based lock (`LockFileEx` on Windows).
    pub struct Fs2Lock(File);

    impl LockBackend for Fs2Lock {
        fn acquire(file: File, mode: LockMode, wait: bool) -> Result<Self, AcquireError> {
            let result = match (mode, wait) {
                (LockMode::Exclusive, true) => fs2::FileExt::lock_exclusive(&file),
                (LockMode::Shared, true) => fs2::FileExt::lock_shared(&file),
                (LockMode::Exclusive, false) => fs2::FileExt::try_lock_exclusive(&file),
                (LockMode::Shared, false) => fs2::FileExt::try_lock_shared(&file),
            };
            match result {
                Ok(()) => Ok(Self(file)),
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    Err(AcquireError::WouldBlock)
                }
                Err(e) => Err(AcquireError::Io(e)),
            }
        }

        fn release(self) -> io::Result<File> {
            fs2::FileExt::unlock(&self.0)?;
            Ok(self.0)
        }

        fn file(&self) -> &File {
            &self.0
        }
    }
}

#[cfg(unix)]
pub(crate) type OsLock = unix::FlockLock;

#[cfg(not(unix))]
pub(crate) type OsLock = portable::Fs2Lock;

/// Whether `file` is still the file found at `path`.
///
/// A holder removes the lock file on unlock; a waiter that opened the old
/// file before the removal must not treat a lock on the orphaned inode as valid.
#[cfg(unix)]
pub(crate) fn is_current(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(on_disk)) => held.dev() == on_disk.dev() && held.ino() == on_disk.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
pub(crate) fn is_current(_file: &File, path: &Path) -> bool {
    path.exists()
}
