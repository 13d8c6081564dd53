//! Error taxonomy for the acquisition and retrieval core.
//!
//! Most code returns [`anyhow::Result`]; the variants here mark the faults
//! that carry distinct recovery rules. Network and parse faults
//! ([`Error::SourceUnavailable`], [`Error::ParseMismatch`]) are absorbed at
//! the fetch boundary, [`Error::IndexUnavailable`] is absorbed by the search
//! engine, and only [`Error::Validation`] and [`Error::InvariantViolation`]
//! reach callers.
//!
//! Wrapped in `anyhow`, a variant can be recovered with
//! `err.downcast_ref::<Error>()`.

/// Result for operations whose failures are typed.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Source unavailable: {message}")]
    SourceUnavailable { message: String },
    #[error("Parse mismatch: strategy '{strategy}' found no valid records at {url}")]
    ParseMismatch { url: String, strategy: String },
    #[error("Index unavailable: {reason}")]
    IndexUnavailable { reason: String },
    #[error("Invalid input: {message}")]
    Validation { message: String },
    #[error("Invariant violated: {message}")]
    InvariantViolation { message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Other(err.into())
    }
}
