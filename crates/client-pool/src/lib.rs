//! Bounded pool of outbound HTTP clients
//!
//! Caps the number of `reqwest::Client` handles checked out at once. Clients
//! are built lazily up to `max_active`, handed out as RAII [`Lease`]s, and go
//! back to an idle queue when the caller releases them after a completed call.
//! A lease dropped without release (failed call, cancelled request) is
//! discarded and its slot freed, so failures never starve the pool.
//!
//! Idle TCP/TLS connections inside each client are torn down by reqwest's own
//! idle timeout; the pool only tracks client handles.

pub mod error;
pub mod pool;

pub use error::{Error, Result};
pub use pool::{ClientPool, Forwarded, Lease, PoolConfig, PoolStats, PooledClient};
