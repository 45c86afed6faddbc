use thiserror::Error;

/// Error taxonomy shared by the store, the change notifier, the live
/// configuration and the scan plugins.
#[derive(Debug, Error)]
pub enum WafError {
    /// Any record store I/O failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The requested record does not exist. Bootstrap code treats this as an
    /// empty state.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rejected before any mutation or persistence took place.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("plugin initialization failed: {0}")]
    PluginInit(String),
}

impl WafError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<redis::RedisError> for WafError {
    fn from(e: redis::RedisError) -> Self {
        Self::Persistence(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WafError>;
