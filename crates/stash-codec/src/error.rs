/// Errors from encoding or decoding stored values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// bincode failed to encode or decode a container or value.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The stored bytes are neither a decimal integer nor a container.
    #[error("malformed stored value: {0}")]
    Malformed(String),

    /// Segments must be at least one byte long.
    #[error("segment size must be non-zero")]
    ZeroSegmentSize,
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
