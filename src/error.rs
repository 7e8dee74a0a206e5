//! Error types surfaced by the MIO core
//!
//! Every fallible operation in the crate returns [`crate::Result`], whose
//! error type carries one of a small set of [`ErrorKind`]s plus a human
//! readable message. Per-pair key-value statuses reuse `ErrorKind` directly
//! (see [`crate::kvs::PairRc`]) so that batch APIs can report fine-grained
//! outcomes without allocating full errors for each entry.

use std::fmt;

/// Classification of an MIO error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed identifier, overlapping IO vectors, unknown hint key/scope.
    InvalidArgument,
    /// Object or key-value entry absent.
    NotFound,
    /// Create on an existing object or key-value set.
    AlreadyExists,
    /// User is not permitted to access the backend.
    PermissionDenied,
    /// Allocation failure reported by a backend.
    OutOfMemory,
    /// Record exceeds the telemetry payload, or one IO vector exceeds the
    /// per-op maximum.
    TooBig,
    /// A wait budget expired while the operation was still in flight.
    Timeout,
    /// Generic backend failure.
    Io,
    /// Operation not implemented by the configured driver.
    Unsupported,
    /// No more pairs in a key-value iteration (per-pair status only).
    EndOfIteration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::TooBig => "too big",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Io => "io error",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::EndOfIteration => "end of iteration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for all MIO operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error { kind, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::AlreadyExists, message)
    }

    pub fn too_big(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::TooBig, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Timeout, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Io, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Unsupported, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
            _ => ErrorKind::Io,
        };
        Error::new(kind, err.to_string())
    }
}
