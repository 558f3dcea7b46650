use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid keyspace {0:?}: {1}")]
    InvalidKeyspace(String, &'static str),

    #[error("value is not an integer")]
    NotAnInteger,

    #[error("serialization error: {0}")]
    Serialization(String),
}
