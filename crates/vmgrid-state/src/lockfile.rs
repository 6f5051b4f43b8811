//! Advisory `flock(2)` locks.
//!
//! Used for the per-document write lock and the daemon singleton lock. The
//! lock is tied to the open file description, so two handles in the same
//! process exclude each other just like two processes do. Dropping the
//! guard releases the lock.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is held.
    pub fn exclusive(path: &Path) -> io::Result<Self> {
        Self::acquire(path, libc::LOCK_EX)
    }

    /// Take the exclusive lock on `path` or fail immediately with
    /// `WouldBlock` when another holder exists.
    pub fn try_exclusive(path: &Path) -> io::Result<Self> {
        Self::acquire(path, libc::LOCK_EX | libc::LOCK_NB)
    }

    fn acquire(path: &Path, operation: libc::c_int) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        loop {
            // SAFETY: the descriptor is owned by `file` and stays open for the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
            if rc == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: as above; the lock would also be released on close.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
