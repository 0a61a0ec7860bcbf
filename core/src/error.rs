/// Core error type shared across the scheduler, the worker channel, and the API surface
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lock already held: {0}")]
    LockAlreadyAcquired(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("external error: {0}")]
    External(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("precondition failed: {0}")]
    Preconditions(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// True for errors that are expected to resolve on their own and are worth retrying,
    /// as opposed to errors that indicate a caller or operator mistake.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Io(_) | Error::External(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
