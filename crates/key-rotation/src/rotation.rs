//! Shared rotation cursor over a fixed key set
//!
//! The cursor is the only mutable state. It sits behind a mutex whose scope
//! covers a single read or a single increment, never an upstream call, so
//! concurrent requests serialize only on the index itself.

use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::key::ApiKey;

/// The key selected for one upstream attempt.
#[derive(Debug, Clone)]
pub struct ActiveKey {
    /// Position in the key set; safe to log.
    pub index: usize,
    pub key: ApiKey,
}

/// Fixed key set plus the circular cursor selecting the active key.
///
/// Owned by the proxy state and shared via `Arc`; tests build isolated
/// instances instead of relying on process-wide state.
pub struct KeyRotation {
    keys: Vec<ApiKey>,
    cursor: Mutex<usize>,
}

impl KeyRotation {
    /// Take ownership of the key set. The cursor starts at index 0.
    pub fn new(keys: Vec<ApiKey>) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::NoKeys);
        }
        info!(keys = keys.len(), "key rotation initialized");
        Ok(Self {
            keys,
            cursor: Mutex::new(0),
        })
    }

    /// The key at the current cursor position.
    pub async fn current(&self) -> ActiveKey {
        let index = *self.cursor.lock().await;
        ActiveKey {
            index,
            key: self.keys[index].clone(),
        }
    }

    /// Advance the cursor by one, wrapping at the end of the set.
    ///
    /// Returns the new index. Concurrent callers each advance by exactly one.
    pub async fn rotate(&self) -> usize {
        let (from, to) = {
            let mut cursor = self.cursor.lock().await;
            let from = *cursor;
            *cursor = (from + 1) % self.keys.len();
            (from, *cursor)
        };
        info!(from, to, "rotated API key");
        to
    }

    /// Current cursor position without cloning the key.
    pub async fn cursor(&self) -> usize {
        *self.cursor.lock().await
    }

    /// Number of keys in the set. Always at least 1.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false; a rotation cannot be built from an empty set.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
