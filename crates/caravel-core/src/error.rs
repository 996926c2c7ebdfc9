use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue closed")]
    QueueClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
