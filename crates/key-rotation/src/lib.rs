//! API key rotation for a single upstream
//!
//! Holds a fixed, ordered set of API keys and a shared cursor pointing at the
//! key currently in use. The proxy reads the active key for every upstream
//! attempt and advances the cursor when upstream rejects a key with 429.
//!
//! Key lifecycle:
//! 1. `parse_keys` turns the comma-separated `API_KEYS` value into validated keys
//! 2. `KeyRotation::new` takes ownership of the set; cursor starts at index 0
//! 3. Each attempt reads `current()`; a 429 calls `rotate()`
//! 4. State lives only in memory and resets on restart

pub mod error;
pub mod key;
pub mod rotation;

pub use error::{Error, Result};
pub use key::{ApiKey, parse_keys};
pub use rotation::{ActiveKey, KeyRotation};
