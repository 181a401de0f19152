//! Service-specific error types

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

/// Startup errors. Any of these stops the process before it serves.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("API key error: {0}")]
    Keys(#[from] key_rotation::Error),

    #[error("Client pool error: {0}")]
    Pool(#[from] client_pool::Error),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

/// Per-request failures. Each one ends the request with a proxy error body;
/// none of them trigger another attempt.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to create request: {0}")]
    RequestConstruction(String),

    #[error("{0}")]
    PoolExhausted(client_pool::Error),

    #[error("failed to make request with API key: {0}")]
    Transport(client_pool::Error),

    #[error("unable to make successful request ({attempts} API keys rate limited)")]
    RateLimitExhausted { attempts: usize },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ProxyError {
    /// Status returned to the caller. Every proxy-side failure is a 500.
    pub fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    /// Label for `proxy_upstream_errors_total{error_type}`.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::RequestConstruction(_) => "request_construction",
            ProxyError::PoolExhausted(_) => "pool_exhausted",
            ProxyError::Transport(e) => e.kind(),
            ProxyError::RateLimitExhausted { .. } => "rate_limit_exhausted",
            ProxyError::Timeout(_) => "timeout",
        }
    }
}

impl From<client_pool::Error> for ProxyError {
    fn from(e: client_pool::Error) -> Self {
        match e {
            client_pool::Error::PoolExhausted { .. } => ProxyError::PoolExhausted(e),
            other => ProxyError::Transport(other),
        }
    }
}
