//! Advisory lock serializing acquisitions of the same target.

use crate::error::DatasetError;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive lock on a well-known lock file, released on drop.
///
/// On Unix this is `flock(2)`, so a killed process never leaves a stale
/// lock behind. Elsewhere the lock file itself is the lock.
#[derive(Debug)]
pub struct DatasetLock {
    path: PathBuf,
    file: File,
}

impl DatasetLock {
    /// Attempts to take the lock without waiting.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, DatasetError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatasetError::fs(parent, e))?;
        }
        match sys::try_lock(path) {
            Ok(Some(file)) => Ok(Some(Self {
                path: path.to_path_buf(),
                file,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatasetError::fs(path, e)),
        }
    }

    /// Waits up to `wait` for the lock, polling without blocking the runtime.
    pub async fn acquire(path: &Path, wait: Duration) -> Result<Self, DatasetError> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                debug!("Acquired lock {}", path.display());
                return Ok(lock);
            }
            if started.elapsed() >= wait {
                return Err(DatasetError::fs(
                    path,
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("lock still held after {:?}", wait),
                    ),
                ));
            }
            if !announced {
                info!("⏳ Waiting for another download holding {}", path.display());
                announced = true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DatasetLock {
    fn drop(&mut self) {
        sys::unlock(&self.path, &self.file);
        debug!("Released lock {}", self.path.display());
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    pub(super) fn try_lock(path: &Path) -> io::Result<Option<File>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let r = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if r == 0 {
            return Ok(Some(file));
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        }
    }

    pub(super) fn unlock(_path: &Path, file: &File) {
        // The file stays; removing it would race with waiters holding the old inode.
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::path::Path;

    pub(super) fn try_lock(path: &Path) -> io::Result<Option<File>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(super) fn unlock(path: &Path, _file: &File) {
        let _ = std::fs::remove_file(path);
    }
}
