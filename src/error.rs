//! Error types for kyronotify.
//!
//! All errors are strongly typed using thiserror. Leaf enums describe one
//! component each (record decoding, the watch registry); `NotifyError` is the
//! top-level type every public operation returns.
//!
//! Errors fall into two scopes:
//! - **fatal**: the kernel handle could not be created or read. The reader
//!   loop terminates and the pipeline is over.
//! - **local**: a single subscription could not be armed or removed, or a
//!   single record could not be decoded. Everything else keeps running.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::WatchId;

/// Errors decoding one binary inotify record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Short read: record needs {needed} bytes, only {available} buffered")]
    ShortRead {
        needed: usize,
        available: usize,
    },

    #[error("Record name length {len} exceeds maximum {max}")]
    NameTooLong {
        len: usize,
        max: usize,
    },
}

/// Errors from the watch-id → subscription table.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Watch {id} is already registered")]
    AlreadyRegistered {
        id: WatchId,
    },

    #[error("Watch {id} is not registered")]
    NotFound {
        id: WatchId,
    },

    #[error("Watch registry is closed")]
    Closed,
}

/// Top-level error type for kyronotify.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to initialize inotify: {source}")]
    Init {
        #[source]
        source: io::Error,
    },

    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        reason: String,
    },

    #[error("Interest mask must name at least one event")]
    EmptyMask,

    #[error("Cannot watch {}: {source}", .path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to remove watch {id}: {source}")]
    Watch {
        id: WatchId,
        #[source]
        source: io::Error,
    },

    #[error("Watch on {} is already armed", .path.display())]
    ArmedAlready {
        path: PathBuf,
    },

    #[error("Watch on {} is closed", .path.display())]
    SubscriptionClosed {
        path: PathBuf,
    },

    #[error("Inotify handle is closed")]
    HandleClosed,

    #[error("Fatal read error on inotify handle: {source}")]
    Read {
        #[source]
        source: io::Error,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl NotifyError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Returns true if this error ends the whole pipeline.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Init { .. } | Self::Read { .. })
    }

    /// Returns true if this error only concerns a single subscription.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument { .. }
                | Self::EmptyMask
                | Self::Path { .. }
                | Self::Watch { .. }
                | Self::ArmedAlready { .. }
                | Self::SubscriptionClosed { .. }
        )
    }

    /// The platform errno carried by this error, if any.
    #[must_use]
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            Self::Init { source }
            | Self::Path { source, .. }
            | Self::Watch { source, .. }
            | Self::Read { source } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type alias for kyronotify operations.
pub type NotifyResult<T> = Result<T, NotifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_short_read() {
        let err = DecodeError::ShortRead {
            needed: 32,
            available: 20,
        };
        let msg = format!("{err}");
        assert!(msg.contains("32"));
        assert!(msg.contains("20"));
    }

    #[test]
    fn test_registry_error_already_registered() {
        let err = RegistryError::AlreadyRegistered { id: WatchId(7) };
        assert!(format!("{err}").contains("already registered"));
    }

    #[test]
    fn test_path_error_carries_errno() {
        let err = NotifyError::Path {
            path: PathBuf::from("/nope"),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert!(err.is_local());
        assert!(!err.is_fatal());
        assert_eq!(err.os_error_code(), Some(libc::ENOENT));
        assert!(format!("{err}").contains("/nope"));
    }

    #[test]
    fn test_init_and_read_are_fatal() {
        let init = NotifyError::Init {
            source: io::Error::from_raw_os_error(libc::EMFILE),
        };
        assert!(init.is_fatal());
        assert_eq!(init.os_error_code(), Some(libc::EMFILE));

        let read = NotifyError::Read {
            source: io::Error::from_raw_os_error(libc::EIO),
        };
        assert!(read.is_fatal());
        assert!(!read.is_local());
    }

    #[test]
    fn test_from_decode_error() {
        let err: NotifyError = DecodeError::NameTooLong { len: 9000, max: 4096 }.into();
        assert!(matches!(err, NotifyError::Decode(_)));
        assert!(!err.is_fatal());
        assert_eq!(err.os_error_code(), None);
    }

    #[test]
    fn test_internal() {
        let err = NotifyError::internal("unexpected state");
        assert!(format!("{err}").contains("unexpected state"));
        assert!(!err.is_local());
    }
}
