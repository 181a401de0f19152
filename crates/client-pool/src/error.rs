//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection pool exhausted ({max_active} clients in use)")]
    PoolExhausted { max_active: usize },

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),
}

impl Error {
    /// Short label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::PoolExhausted { .. } => "pool_exhausted",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Build(_) => "client_build",
            Error::Transport(e) if e.is_timeout() => "timeout",
            Error::Transport(e) if e.is_connect() => "connection",
            Error::Transport(_) => "transport",
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
