use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("No settings registered under name: {0}")]
    UnknownClient(String),

    #[error("Invalid transaction state: {current} (expected: {expected})")]
    TransactionState {
        current: &'static str,
        expected: &'static str,
    },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Queue closed")]
    QueueClosed,

    #[error("Transport disconnected")]
    Disconnected,

    #[error("Pool closed")]
    PoolClosed,

    #[error(transparent)]
    Core(#[from] caravel_core::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient transport failures worth another attempt after backoff.
    /// State, settings and lifecycle errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Timeout(_) | Error::Broker(_) | Error::Disconnected
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure returned by a record handler.
///
/// Everything except invalid-input, invalid-operation, and malformed-payload
/// failures is considered transient: the worker waits one backoff interval
/// and retries the handler exactly once before escalating.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Other(_))
    }

    /// Variant name, used for the escalation diagnostic headers.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::InvalidInput(_) => "InvalidInput",
            HandlerError::InvalidOperation(_) => "InvalidOperation",
            HandlerError::Malformed(_) => "Malformed",
            HandlerError::Other(_) => "Other",
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Other(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Other(message.to_string())
    }
}
