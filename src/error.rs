//! Error types shared across the service manager.

use thiserror::Error;

/// Wire-level error classification. Every [`Error`] maps onto one of these
/// codes; the code travels to the CM inside `ErrorInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    None = 0,
    Failed = 1,
    NotFound = 2,
    InvalidArgument = 3,
    NoSpace = 4,
    Validation = 5,
    Timeout = 6,
    Network = 7,
    Unavailable = 8,
    AlreadyExists = 9,
}

/// Main error type for SM operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Failed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no space: {0}")]
    NoSpace(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unit exited with code {0}")]
    ExitCode(i32),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Failed(_) | Error::Io(_) | Error::Json(_) | Error::ExitCode(_) => {
                ErrorCode::Failed
            }
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::NoSpace(_) => ErrorCode::NoSpace,
            Error::Validation(_) => ErrorCode::Validation,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Network(_) => ErrorCode::Network,
            Error::Unavailable(_) => ErrorCode::Unavailable,
            Error::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Error::Database(sqlx::Error::RowNotFound) => ErrorCode::NotFound,
            Error::Database(_) => ErrorCode::Failed,
        }
    }

    /// Process exit code carried by the error, if any. Only meaningful for
    /// unit failures reported by the runner.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::ExitCode(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Network(status.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::Failed(format!("system error: {err}"))
    }
}

impl From<&Error> for crate::proto::ErrorInfo {
    fn from(err: &Error) -> Self {
        crate::proto::ErrorInfo {
            aos_code: err.code() as i32,
            exit_code: err.exit_code().unwrap_or(0),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
