use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("store is closed")]
    Closed,
    #[error("unknown store: {0}")]
    UnknownStore(String),
    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn persistence(msg: impl Into<String>) -> Self {
        Error::Persistence(msg.into())
    }

    /// Errors that originate in the backing store and may indicate data loss.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Persistence(_) | Error::Corrupt(_) | Error::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
