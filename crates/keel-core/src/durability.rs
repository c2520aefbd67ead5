//! Durable sync primitives
//!
//! `durable_sync` maps to the strongest "data is on the medium" call each
//! platform offers. `sync_dir` makes a rename or unlink inside a directory
//! survive a crash on platforms where that needs an explicit directory fsync.

use std::fs::File;
use std::io;
use std::path::Path;

/// Block until the file's data has reached persistent storage.
///
/// - Linux: fdatasync() (data only, metadata is not needed for replay)
/// - macOS/iOS: fcntl(F_FULLFSYNC); plain fsync only reaches the drive cache
/// - Windows: FlushFileBuffers()
/// - Other: File::sync_data()
///
/// May block for a long time under heavy I/O; do not call it while holding a
/// lock that readers need.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live File reference.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Persist directory entries (renames, creations, unlinks) of `dir`.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }

    // Windows cannot open directories as files; NTFS journals the metadata.
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
