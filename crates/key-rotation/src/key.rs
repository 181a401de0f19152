//! API key secret wrapper and `API_KEYS` parsing

use std::fmt;

use reqwest::header::HeaderValue;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// A single upstream API key - redacted in Debug/Display/logs.
///
/// Construction validates that the key can be sent as an HTTP header value,
/// so injecting it into an outbound request cannot fail later on.
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a raw key. `position` is only used for the error message.
    pub fn new(value: String, position: usize) -> Result<Self> {
        if value.is_empty() || HeaderValue::from_str(&value).is_err() {
            let mut value = value;
            value.zeroize();
            return Err(Error::InvalidKey { position });
        }
        Ok(Self(value))
    }

    /// Expose the raw key (use sparingly)
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Header value for the credential header, flagged sensitive so it is
    /// never printed by the HTTP stack's own debug output.
    pub fn header_value(&self) -> std::result::Result<HeaderValue, reqwest::header::InvalidHeaderValue> {
        let mut value = HeaderValue::from_str(&self.0)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Drop for ApiKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Clone for ApiKey {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Parse a comma-separated key list such as the `API_KEYS` env var.
///
/// Segments are trimmed and empty segments skipped, so `"a, b,,c,"` yields
/// three keys. Positions in errors are 0-based over the non-empty keys.
pub fn parse_keys(raw: &str) -> Result<Vec<ApiKey>> {
    let keys = raw
        .split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .enumerate()
        .map(|(position, segment)| ApiKey::new(segment.to_owned(), position))
        .collect::<Result<Vec<_>>>()?;

    if keys.is_empty() {
        return Err(Error::NoKeys);
    }
    Ok(keys)
}
