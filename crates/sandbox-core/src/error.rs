//! Error kinds per spec §7. `CoreError` is the one type that crosses every
//! component boundary inside the engine; the HTTP layer maps `kind()` onto a
//! status code and never sees the underlying `anyhow`/`sqlx`/`io` source.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    TransientTransport,
    ProtocolViolation,
    SubprocessFailure,
    StorageFailure,
    FatalState,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient transport failure: {0}")]
    TransientTransport(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("subprocess failure: {0}")]
    SubprocessFailure(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("fatal state: {0}")]
    FatalState(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::TransientTransport(_) => ErrorKind::TransientTransport,
            CoreError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            CoreError::SubprocessFailure(_) => ErrorKind::SubprocessFailure,
            CoreError::StorageFailure(_) => ErrorKind::StorageFailure,
            CoreError::FatalState(_) => ErrorKind::FatalState,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::StorageFailure(e.to_string())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".into()),
            other => CoreError::StorageFailure(other.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
