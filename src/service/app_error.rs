pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// lifecycle misuse: start after stop, stop before start, and the like
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// a configured read or write deadline elapsed
    #[error("{0} deadline exceeded")]
    Timeout(&'static str),

    /// non-blocking enqueue hit a full queue; the connection is evicted
    #[error("{0} queue is full")]
    QueueFull(&'static str),

    #[error("connection closed")]
    ConnectionClosed,

    /// an error reported by a handler callback
    #[error("handler error: {0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    #[error("body length {0} exceeds limit {1}")]
    BodyTooLarge(usize, usize),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),
}

impl AppError {
    /// Convenience constructor for handler-reported errors.
    pub fn handler(message: impl Into<String>) -> AppError {
        AppError::Handler(message.into())
    }
}
