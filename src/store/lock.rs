//! Advisory file locks guarding per-target metadata.
//!
//! Whole-file `fcntl` record locks, shared or exclusive. Acquiring a lock
//! returns a guard that remembers the previously-held mode and restores it
//! on drop, so a read taken while a write lock is held temporarily drops to
//! shared and returns to exclusive afterwards.

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use tracing::trace;

use crate::ops::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// An open lock file. Not thread-safe: the engine runs a single control
/// thread per process, and cross-process exclusion is what the lock is for.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    held: Cell<Option<LockMode>>,
}

impl LockFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(path)?;
        Ok(LockFile {
            file,
            held: Cell::new(None),
        })
    }

    pub fn shared(&self) -> Result<LockGuard<'_>> {
        self.acquire(LockMode::Shared)
    }

    pub fn exclusive(&self) -> Result<LockGuard<'_>> {
        self.acquire(LockMode::Exclusive)
    }

    #[cfg(test)]
    fn held(&self) -> Option<LockMode> {
        self.held.get()
    }

    fn acquire(&self, mode: LockMode) -> Result<LockGuard<'_>> {
        let prev = self.held.get();
        if prev != Some(mode) {
            trace!("lock (wait): {:?}", mode);
            self.fcntl_lock(Some(mode))?;
            self.held.set(Some(mode));
        }
        Ok(LockGuard { lock: self, prev })
    }

    fn fcntl_lock(&self, mode: Option<LockMode>) -> io::Result<()> {
        let l_type = match mode {
            Some(LockMode::Shared) => libc::F_RDLCK,
            Some(LockMode::Exclusive) => libc::F_WRLCK,
            None => libc::F_UNLCK,
        };
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = l_type as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        // l_start/l_len zero: the whole file
        loop {
            let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETLKW, &fl) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// Restores the lock to its pre-acquisition mode when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a LockFile,
    prev: Option<LockMode>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.lock.held.get() == self.prev {
            return;
        }
        if self.lock.fcntl_lock(self.prev).is_ok() {
            self.lock.held.set(self.prev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn guard_restores_previous_mode() {
        let dir = tempdir().unwrap();
        let lock = LockFile::open(&dir.path().join("l")).unwrap();
        assert_eq!(lock.held(), None);

        {
            let _ex = lock.exclusive().unwrap();
            assert_eq!(lock.held(), Some(LockMode::Exclusive));
            {
                let _sh = lock.shared().unwrap();
                assert_eq!(lock.held(), Some(LockMode::Shared));
            }
            assert_eq!(lock.held(), Some(LockMode::Exclusive));
        }
        assert_eq!(lock.held(), None);
    }

    #[test]
    fn reacquiring_the_same_mode_is_a_no_op() {
        let dir = tempdir().unwrap();
        let lock = LockFile::open(&dir.path().join("l")).unwrap();
        let _a = lock.shared().unwrap();
        let _b = lock.shared().unwrap();
        assert_eq!(lock.held(), Some(LockMode::Shared));
        drop(_b);
        assert_eq!(lock.held(), Some(LockMode::Shared));
    }
}
