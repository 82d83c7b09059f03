use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("checksum mismatch: {0}")]
    Checksum(&'static str),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("misuse: {0}")]
    Misuse(&'static str),

    #[error("worker failure: {0}")]
    Worker(String),
}

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub(crate) fn type_mismatch(msg: impl Into<String>) -> Self {
        Error::TypeMismatch(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
