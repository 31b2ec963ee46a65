use thiserror::Error;

pub type SdResult<T> = Result<T, SdError>;

#[derive(Debug, Error)]
pub enum SdError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
