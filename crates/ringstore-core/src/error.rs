//! Typed error taxonomy for the ring engine.

use thiserror::Error;

/// Errors a ring engine operation can return.
#[derive(Debug, Error)]
pub enum RingStoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("wrong format: {0}")]
    WrongFormat(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("locked: {0}")]
    Locked(String),

    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("ring revoked: {0}")]
    RingRevoked(String),

    #[error("invalid argument: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, RingStoreError>;
