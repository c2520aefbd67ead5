//! Advisory lock on a store's `LOCK` file
//!
//! One open handle per store. The lock lives as long as the `StoreLock`
//! value; closing the file descriptor releases it. `flock` locks belong to
//! the open file description, so a second open of the same store from the
//! same process is refused too.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{KeelError, KeelResult};

pub const LOCK_FILE: &str = "LOCK";

#[derive(Debug)]
pub struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Take the exclusive lock for the store in `dir`, without blocking.
    pub fn acquire(dir: &Path) -> KeelResult<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| KeelError::io_at(&path, "open lock file", e))?;

        Self::try_lock(&file).map_err(|e| KeelError::Locked {
            path: path.clone(),
            message: format!("already held by another handle ({})", e),
        })?;

        // Pid is only for whoever inspects the directory by hand
        file.set_len(0).and_then(|_| writeln!(file, "{}", std::process::id()))
            .map_err(|e| KeelError::io_at(&path, "write lock file", e))?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};

        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        // SAFETY: the handle comes from a live File reference and `overlapped` outlives the call.
        let result = unsafe {
            LockFileEx(
                file.as_raw_handle() as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                &mut overlapped,
            )
        };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let lock = StoreLock::acquire(dir.path()).unwrap();
        assert!(lock.path().ends_with(LOCK_FILE));

        let second = StoreLock::acquire(dir.path());
        assert!(matches!(second, Err(KeelError::Locked { .. })));

        drop(lock);
        assert!(StoreLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_lock_file_records_pid() {
        let dir = TempDir::new().unwrap();
        let _lock = StoreLock::acquire(dir.path()).unwrap();
        let contents = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }
}
