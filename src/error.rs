//! Error types for mrcache.

use crate::memory::CacheState;
use thiserror::Error;

/// Result type alias using mrcache's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Error reported by a hardware registration backend.
///
/// Backends are free to use their own error types; the cache carries them
/// boxed and hands them back to the caller unchanged.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for registration cache operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad configuration, zero-length range or invalid access flags.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation of cache bookkeeping failed. No state was changed.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The hard registration limit has been reached.
    #[error("registration limit reached ({limit} entries in use)")]
    ResourceExhausted {
        /// The configured hard registration limit.
        limit: i64,
    },

    /// No live registration matches the request.
    #[error("no registration found for {address:#x}+{length:#x}")]
    NotFound {
        /// Start address of the range that was looked up.
        address: u64,
        /// Length of the range that was looked up.
        length: u64,
    },

    /// The hardware backend rejected the request.
    #[error("backend failure: {0}")]
    Backend(#[source] BackendError),

    /// The cache still has registrations in use.
    #[error("cache busy: {in_use} registrations still in use")]
    Busy {
        /// Number of in-use entries at the time of the call.
        in_use: usize,
    },

    /// Operation attempted on a cache that is not ready.
    #[error("cache is {0:?}")]
    InvalidState(CacheState),

    /// Internal invariant violated. Indicates a cache bug.
    #[error("cache inconsistency: {0}")]
    Inconsistent(String),
}

impl Error {
    /// Returns true for errors that indicate a bug in the cache rather than
    /// a transient or caller-side condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Inconsistent(_))
    }

    /// Returns true if the error came from the hardware backend.
    pub fn is_backend(&self) -> bool {
        matches!(self, Error::Backend(_))
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(err: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory(err.to_string())
    }
}
