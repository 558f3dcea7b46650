/// Errors from backend primitives.
///
/// A miss is not an error: primitives report it as `Ok(None)` / `Ok(false)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend did not answer in time.
    #[error("backend timed out: {0}")]
    Timeout(String),

    /// The backend has no native implementation of this primitive.
    #[error("operation not supported by backend: {0}")]
    Unsupported(&'static str),

    /// Internal lock poisoned by a panicking writer.
    #[error("backend state poisoned: {0}")]
    Poisoned(String),
}

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
