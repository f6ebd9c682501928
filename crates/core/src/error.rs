/// Result alias that carries the custom [`ScopeError`] type.
pub type Result<T> = std::result::Result<T, ScopeError>;

/// Common error type for the core crate.
///
/// Every variant is produced at setup time or by a non-real-time control
/// call. The producer path never returns an error.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    /// The configuration was rejected before the engine started.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An argument to a control call was outside its valid domain.
    #[error("{0}")]
    InvalidInput(&'static str),
    /// A slider index beyond the slider count fixed at setup.
    #[error("slider index {index} out of range (slider count {count})")]
    SliderOutOfRange { index: usize, count: usize },
    /// The control queue towards the producer has no free slot.
    #[error("control queue is full")]
    QueueFull,
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Fft(#[from] realfft::FftError),
}

impl ScopeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn config<T: Into<String>>(msg: T) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<&str> for ScopeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for ScopeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
