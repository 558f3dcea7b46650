//! Error types and the per-client last-error register.
//!
//! Expected failures (a miss, a lost race, a lock held elsewhere) are
//! reported as `None`/`false` by the client. When a `false` is caused by an
//! actual failure, the cause is also recorded in the client's
//! [`ErrorState`] so callers can tell "not found" apart from "broken".

use std::sync::{Mutex, PoisonError};

use stash_backend::BackendError;
use stash_codec::CodecError;
use stash_types::TypeError;
use thiserror::Error;

/// Errors recorded by the cache client.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// A backend primitive failed at the I/O level.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Stored bytes could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The serialized value exceeds the segmented value limit.
    #[error("value for {key} is {size} bytes, over the {max} byte limit")]
    ValueTooLarge { key: String, size: usize, max: usize },

    /// The caller used an operation in a way it does not support.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<TypeError> for CacheError {
    fn from(e: TypeError) -> Self {
        Self::InvalidConfig(e.to_string())
    }
}

/// Result alias for client operations that can fail fast.
pub type CacheResult<T> = Result<T, CacheError>;

/// Coarse classification of the last error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheErrorKind {
    /// No error since the register was last cleared.
    None,
    /// The backend did not answer in time.
    NoResponse,
    /// The backend could not be reached.
    Unreachable,
    /// Anything else: corrupt data, oversize values, misuse.
    Unexpected,
}

impl CacheError {
    pub fn kind(&self) -> CacheErrorKind {
        match self {
            Self::Backend(BackendError::Unreachable(_)) => CacheErrorKind::Unreachable,
            Self::Backend(BackendError::Timeout(_)) => CacheErrorKind::NoResponse,
            _ => CacheErrorKind::Unexpected,
        }
    }
}

/// One "last error" slot per client instance.
#[derive(Debug, Default)]
pub struct ErrorState {
    last: Mutex<Option<CacheError>>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the last error.
    pub fn record(&self, error: CacheError) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub fn clear(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn last(&self) -> Option<CacheError> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kind(&self) -> CacheErrorKind {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(CacheErrorKind::None, CacheError::kind)
    }

    pub fn is_set(&self) -> bool {
        self.kind() != CacheErrorKind::None
    }
}
