//! Helpers for crossing the engine's C interface: error out-parameters,
//! path conversion, and malloc'd buffers handed back by the engine.

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;
use std::ptr;

use keel_core::capi;

use crate::error::{Error, Result};

/// Owns the `char*` an engine call may fill through its `errptr` argument.
pub(crate) struct ErrorSlot {
    message: *mut c_char,
}

impl ErrorSlot {
    pub(crate) fn new() -> Self {
        Self { message: ptr::null_mut() }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut *mut c_char {
        &mut self.message
    }

    /// `Ok` if the engine left no message, otherwise the message wrapped by `kind`.
    pub(crate) fn check(mut self, kind: fn(String) -> Error) -> Result<()> {
        match self.take() {
            None => Ok(()),
            Some(message) => Err(kind(message)),
        }
    }

    fn take(&mut self) -> Option<String> {
        if self.message.is_null() {
            return None;
        }
        // SAFETY: the engine stores a NUL-terminated malloc'd string here.
        let message = unsafe { CStr::from_ptr(self.message) }.to_string_lossy().into_owned();
        unsafe { capi::keel_free(self.message as *mut c_void) };
        self.message = ptr::null_mut();
        Some(message)
    }
}

impl Drop for ErrorSlot {
    fn drop(&mut self) {
        self.take();
    }
}

/// Convert a store path for the C interface. Empty paths and paths with an
/// interior NUL byte cannot be expressed there.
pub(crate) fn path_to_cstring(path: &Path) -> Result<CString> {
    if path.as_os_str().is_empty() {
        return Err(Error::ContractViolation("path must not be empty".to_string()));
    }

    #[cfg(unix)]
    let raw = {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let raw = path
        .to_str()
        .ok_or_else(|| Error::ContractViolation(format!("path {:?} is not valid UTF-8", path)))?
        .as_bytes()
        .to_vec();

    CString::new(raw)
        .map_err(|_| Error::ContractViolation(format!("path {:?} contains a NUL byte", path)))
}

/// Copy `len` bytes out of an engine-allocated buffer and free it.
///
/// # Safety
/// `data` must be null or a buffer of at least `len` bytes from the engine's allocator.
pub(crate) unsafe fn take_buffer(data: *mut c_char, len: usize) -> Option<Vec<u8>> {
    if data.is_null() {
        return None;
    }
    let out = std::slice::from_raw_parts(data as *const u8, len).to_vec();
    capi::keel_free(data as *mut c_void);
    Some(out)
}

/// Copy a NUL-terminated engine string and free it.
///
/// # Safety
/// `data` must be null or a NUL-terminated string from the engine's allocator.
pub(crate) unsafe fn take_string(data: *mut c_char) -> Option<String> {
    if data.is_null() {
        return None;
    }
    let out = CStr::from_ptr(data).to_string_lossy().into_owned();
    capi::keel_free(data as *mut c_void);
    Some(out)
}

/// Copy a borrowed (pointer, length) view; null reads as empty.
///
/// # Safety
/// `data` must be null or valid for `len` bytes for the duration of the call.
pub(crate) unsafe fn copy_borrowed(data: *const c_char, len: usize) -> Vec<u8> {
    if data.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data as *const u8, len).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_nul_paths_rejected() {
        assert!(matches!(path_to_cstring(Path::new("")), Err(Error::ContractViolation(_))));
        assert!(matches!(path_to_cstring(Path::new("a\0b")), Err(Error::ContractViolation(_))));
        assert_eq!(path_to_cstring(Path::new("/tmp/db")).unwrap().as_bytes(), b"/tmp/db");
    }

    #[test]
    fn test_error_slot_maps_engine_message() {
        let mut slot = ErrorSlot::new();
        unsafe {
            capi::keel_open(ptr::null(), c_path("").as_ptr(), slot.as_mut_ptr());
        }
        let err = slot.check(Error::Open).unwrap_err();
        assert!(matches!(err, Error::Open(message) if message.starts_with("Invalid argument")));

        assert!(ErrorSlot::new().check(Error::Write).is_ok());
    }

    fn c_path(s: &str) -> CString {
        CString::new(s).unwrap()
    }
}
