use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("Transient upstream error: {0}")]
    TransientUpstream(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Application error: {0}")]
    Application(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Realtime notifier is already running")]
    AlreadyRunning,

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl KvError {
    /// Returns `true` when a retry loop may attempt the failed call again.
    ///
    /// Cancellation and configuration failures always reach the caller, and a
    /// malformed payload stays malformed no matter how often it is decoded.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled(_)
                | Self::Configuration(_)
                | Self::MalformedMessage(_)
                | Self::AlreadyRunning
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, KvError>;

impl<T> From<std::sync::PoisonError<T>> for KvError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
