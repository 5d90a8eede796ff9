//! Error types for endpoint operations.
//!
//! Only genuine failures live here. Conditions that drive normal control
//! flow (an operation still pending, a non-blocking call that would block,
//! a peer that aborted before its connection was accepted) are reported
//! through return values instead.

use std::io;
use thiserror::Error;

/// Errors surfaced to the owner of an endpoint or pool.
#[derive(Debug, Error)]
pub enum Error {
    /// A system call failed. Carries the platform error code.
    #[error("system error {code}: {description}")]
    Os { code: i32, description: String },

    /// The payload does not fit the fixed write buffer. Nothing was sent.
    #[error("payload of {len} bytes exceeds buffer capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    /// The endpoint has no socket bound to it.
    #[error("endpoint is not bound to a socket")]
    NotBound,

    /// The completion ring has no room for another submission.
    #[error("submission queue is full")]
    QueueFull,

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O failure without an OS error code.
    #[error(transparent)]
    Io(io::Error),
}

/// Result type alias for endpoint operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an error from a raw platform error code.
    pub fn from_code(code: i32) -> Self {
        Error::Os {
            code,
            description: io::Error::from_raw_os_error(code).to_string(),
        }
    }

    /// The platform error code, if there is one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Os { code, .. } => Some(*code),
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Error::from_code(code),
            None => Error::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_keeps_code_and_description() {
        let err = Error::from(io::Error::from_raw_os_error(libc::ECONNRESET));
        assert_eq!(err.code(), Some(libc::ECONNRESET));

        let text = err.to_string();
        assert!(text.starts_with(&format!("system error {}", libc::ECONNRESET)));
    }

    #[test]
    fn test_io_error_without_code() {
        let err = Error::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.code(), None);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_payload_too_large_message() {
        let err = Error::PayloadTooLarge {
            len: 2048,
            capacity: 1024,
        };
        assert_eq!(
            err.to_string(),
            "payload of 2048 bytes exceeds buffer capacity of 1024 bytes"
        );
    }
}
