//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. The TOML file is
//! optional; a fresh deployment only needs `API_KEYS`. Keys are loaded from
//! the `API_KEYS` env var or `upstream.api_keys_file`, never stored in the
//! TOML directly to avoid leaking secrets.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderName;
use client_pool::ClientPool;
use key_rotation::{ApiKey, parse_keys};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Default config file, loaded only when present.
const DEFAULT_CONFIG_FILE: &str = "key-rotating-proxy.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(skip)]
    pub api_keys: Vec<ApiKey>,
}

/// Inbound listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Ceiling for reading the inbound request body.
    pub read_timeout_secs: u64,
    /// Ceiling for producing the response to the caller.
    pub write_timeout_secs: u64,
    pub max_connections: usize,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            read_timeout_secs: 60,
            write_timeout_secs: 60,
            max_connections: 1000,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Upstream origin and credential injection
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    /// Header overwritten with the active API key on every attempt.
    pub credential_header: String,
    /// File holding the key list (alternative to the API_KEYS env var).
    /// Commas and newlines both separate keys.
    pub api_keys_file: Option<PathBuf>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "https://api.anthropic.com".into(),
            credential_header: "x-api-key".into(),
            api_keys_file: None,
        }
    }
}

/// Outbound client pool sizing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_idle: usize,
    pub max_active: usize,
    pub idle_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle: 10,
            max_active: 50,
            idle_timeout_secs: 190,
            request_timeout_secs: 200,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then overlay
    /// environment variables and validate.
    ///
    /// Key resolution order:
    /// 1. API_KEYS env var
    /// 2. api_keys_file path from config
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Config = match path {
            Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
            None => Config::default(),
        };

        if let Ok(port) = std::env::var("PORT") {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("invalid PORT {port:?}: {e}")))?;
            config.server.listen_addr.set_port(port);
        }

        config.api_keys = config.resolve_keys()?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file from CLI arg or CONFIG_PATH env var, falling
    /// back to the default file name only when it exists.
    pub fn resolve_path(cli_path: Option<&str>) -> Option<PathBuf> {
        if let Some(p) = cli_path {
            return Some(PathBuf::from(p));
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return Some(PathBuf::from(p));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    }

    /// The validated credential header name.
    pub fn credential_header(&self) -> Result<HeaderName> {
        HeaderName::from_str(&self.upstream.credential_header).map_err(|e| {
            Error::Config(format!(
                "invalid credential_header {:?}: {e}",
                self.upstream.credential_header
            ))
        })
    }

    /// Build the outbound client pool from the `[pool]` section.
    pub fn build_pool(&self) -> Result<ClientPool> {
        Ok(ClientPool::new(self.pool_config())?)
    }

    pub fn pool_config(&self) -> client_pool::PoolConfig {
        client_pool::PoolConfig {
            max_idle: self.pool.max_idle,
            max_active: self.pool.max_active,
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            request_timeout: Duration::from_secs(self.pool.request_timeout_secs),
        }
    }

    fn resolve_keys(&self) -> Result<Vec<ApiKey>> {
        match std::env::var("API_KEYS") {
            Ok(raw) if !raw.trim().is_empty() => return Ok(parse_keys(&raw)?),
            _ => {}
        }

        if let Some(ref key_file) = self.upstream.api_keys_file {
            let raw = std::fs::read_to_string(key_file).map_err(|e| {
                Error::Config(format!(
                    "failed to read api_keys_file {}: {e}",
                    key_file.display()
                ))
            })?;
            return Ok(parse_keys(&raw.replace(['\n', '\r'], ","))?);
        }

        Err(Error::Config(
            "API_KEYS environment variable not set".into(),
        ))
    }

    fn validate(&self) -> Result<()> {
        if !self.upstream.url.starts_with("http://") && !self.upstream.url.starts_with("https://")
        {
            return Err(Error::Config(format!(
                "upstream url must start with http:// or https://, got: {}",
                self.upstream.url
            )));
        }
        let url = reqwest::Url::parse(&self.upstream.url)
            .map_err(|e| Error::Config(format!("invalid upstream url: {e}")))?;
        if url.query().is_some() || url.fragment().is_some() {
            return Err(Error::Config(format!(
                "upstream url must not carry a query or fragment, got: {}",
                self.upstream.url
            )));
        }

        self.credential_header()?;

        if self.server.read_timeout_secs == 0 || self.server.write_timeout_secs == 0 {
            return Err(Error::Config(
                "server timeouts must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.server.max_body_bytes == 0 {
            return Err(Error::Config(
                "max_body_bytes must be greater than 0".into(),
            ));
        }
        if self.pool.max_active == 0 {
            return Err(Error::Config(
                "pool max_active must be greater than 0".into(),
            ));
        }
        if self.pool.idle_timeout_secs == 0 {
            return Err(Error::Config(
                "pool idle_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.pool.request_timeout_secs <= self.pool.idle_timeout_secs {
            return Err(Error::Config(format!(
                "pool request_timeout_secs ({}) must be longer than idle_timeout_secs ({})",
                self.pool.request_timeout_secs, self.pool.idle_timeout_secs
            )));
        }
        Ok(())
    }
}
