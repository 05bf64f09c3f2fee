//! Typed status errors shared by every crate in the workspace.
//!
//! Callers branch on the error kind: a full pool surfaces
//! `ServiceUnavailable`, a corrupt log surfaces `Corruption`, and per-row
//! outcomes travel on the wire as an [`ErrorCode`] + message pair.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for catalog, consensus, and tablet operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already present: {0}")]
    AlreadyPresent(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Wire-serializable discriminant of [`Error`], carried in per-row results
/// and commit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Config,
    Corruption,
    ServiceUnavailable,
    InvalidArgument,
    InvalidSchema,
    NotFound,
    AlreadyPresent,
    IllegalState,
    TimedOut,
    Aborted,
    Io,
    Serialization,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Config(_) => ErrorCode::Config,
            Error::Corruption(_) => ErrorCode::Corruption,
            Error::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::InvalidSchema(_) => ErrorCode::InvalidSchema,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::AlreadyPresent(_) => ErrorCode::AlreadyPresent,
            Error::IllegalState(_) => ErrorCode::IllegalState,
            Error::TimedOut(_) => ErrorCode::TimedOut,
            Error::Aborted(_) => ErrorCode::Aborted,
            Error::Io(_) => ErrorCode::Io,
            Error::Serialization(_) => ErrorCode::Serialization,
        }
    }

    /// Rebuild an error from its wire form.
    pub fn from_code(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::Config => Error::Config(message),
            ErrorCode::Corruption => Error::Corruption(message),
            ErrorCode::ServiceUnavailable => Error::ServiceUnavailable(message),
            ErrorCode::InvalidArgument => Error::InvalidArgument(message),
            ErrorCode::InvalidSchema => Error::InvalidSchema(message),
            ErrorCode::NotFound => Error::NotFound(message),
            ErrorCode::AlreadyPresent => Error::AlreadyPresent(message),
            ErrorCode::IllegalState => Error::IllegalState(message),
            ErrorCode::TimedOut => Error::TimedOut(message),
            ErrorCode::Aborted => Error::Aborted(message),
            ErrorCode::Io => {
                Error::Io(std::io::Error::new(std::io::ErrorKind::Other, message))
            }
            ErrorCode::Serialization => {
                Error::Corruption(format!("serialization error: {message}"))
            }
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut(_))
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Error::ServiceUnavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_present(&self) -> bool {
        matches!(self, Error::AlreadyPresent(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}
