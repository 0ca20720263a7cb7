//! Error taxonomy shared across the service.
//!
//! Every client-visible failure maps to one variant here; the connection
//! handler turns the variant into a wire error code plus a human-readable
//! message on the reply frame.

use thiserror::Error;

/// Service-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Request payload failed shape or bound validation.
    #[error("{0}")]
    InvalidInput(String),

    /// Unknown session id.
    #[error("Session {0} not found")]
    SessionNotFound(String),

    /// Unknown category id.
    #[error("Category not found")]
    CategoryNotFound,

    /// Non-terminated session count reached the configured cap.
    #[error("Maximum session limit ({0}) reached")]
    QuotaExceeded(usize),

    /// Identity gate rejected the peer.
    #[error("Unauthorized")]
    Unauthorized,

    /// Token bucket empty for this client.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Durable store failure.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Filesystem or PTY I/O failure (spawn, data directory).
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire error code carried on error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::CategoryNotFound => "CATEGORY_NOT_FOUND",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Store(_) => "STORE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
