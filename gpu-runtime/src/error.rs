//! Runtime call errors

use std::panic::Location;
use thiserror::Error;

/// Error code used when a runtime reports no usable code of its own.
pub const GENERIC_FAILURE: i32 = 1;

/// A failed call into the accelerator runtime.
///
/// Carries the name of the runtime entry point, its raw status code and the
/// source location of the call site, so that the binary can print the same
/// `call / file / line` triple for every backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{call} failed: {message} (code {code}) at {file}:{line}")]
pub struct RuntimeError {
    pub call: &'static str,
    pub code: i32,
    pub message: String,
    pub file: &'static str,
    pub line: u32,
}

impl RuntimeError {
    /// Build an error located at the caller.
    #[track_caller]
    pub fn new(call: &'static str, code: i32, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            call,
            code,
            message: message.into(),
            file: location.file(),
            line: location.line(),
        }
    }

    /// Status to hand to the operating system when this error ends the process.
    ///
    /// Mirrors `exit(code)`: only the low byte survives, and a code whose low
    /// byte is zero must not look like success.
    pub fn exit_status(&self) -> u8 {
        match (self.code & 0xff) as u8 {
            0 => GENERIC_FAILURE as u8,
            status => status,
        }
    }
}

/// Result type for runtime calls.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_records_call_site() {
        let err = RuntimeError::new("hipMalloc", 2, "out of memory");
        assert_eq!(err.call, "hipMalloc");
        assert!(err.file.ends_with("error.rs"));
        assert!(err.line > 0);

        let rendered = err.to_string();
        assert!(rendered.starts_with("hipMalloc failed: out of memory (code 2)"));
    }

    #[test]
    fn test_exit_status_keeps_low_byte() {
        assert_eq!(RuntimeError::new("hipSetDevice", 101, "").exit_status(), 101);
        // 704 = 0x2c0
        assert_eq!(RuntimeError::new("hipDeviceEnablePeerAccess", 704, "").exit_status(), 0xc0);
        // 256 would wrap to success
        assert_eq!(RuntimeError::new("hipFree", 256, "").exit_status(), 1);
    }
}
