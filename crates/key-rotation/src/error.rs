//! Error types for key set construction

/// Errors raised while building the key set.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no API keys configured")]
    NoKeys,

    #[error("API key at position {position} is not a valid header value")]
    InvalidKey { position: usize },
}

/// Result alias for key rotation operations.
pub type Result<T> = std::result::Result<T, Error>;
