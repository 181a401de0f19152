//! Client pool with lazy construction and RAII leases
//!
//! The pool tracks `live` clients (built and not yet discarded) separately
//! from the idle queue. Construction is gated on `live`, not on the queue
//! length, so the number of clients in existence never exceeds `max_active`
//! no matter how many are checked out at once.
//!
//! The slot state sits behind a `std::sync::Mutex` because leases give their
//! client back from `Drop`. The lock covers only queue/counter updates and is
//! never held across an `.await`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Pool sizing and per-client transport settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle keep-alive connections each client may hold to the upstream.
    pub max_idle: usize,
    /// Upper bound on clients in existence (idle + checked out).
    pub max_active: usize,
    /// How long an idle keep-alive connection survives inside a client.
    pub idle_timeout: Duration,
    /// Ceiling for a whole upstream call, including reading the body.
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 10,
            max_active: 50,
            idle_timeout: Duration::from_secs(190),
            request_timeout: Duration::from_secs(200),
        }
    }
}

/// A reusable outbound client tagged with a pool-unique identity.
#[derive(Debug, Clone)]
pub struct PooledClient {
    id: u64,
    http: reqwest::Client,
}

impl PooledClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

/// Point-in-time pool accounting for health and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub max_active: usize,
}

#[derive(Debug)]
struct Slots {
    idle: VecDeque<PooledClient>,
    live: usize,
}

#[derive(Debug)]
struct Shared {
    config: PoolConfig,
    slots: Mutex<Slots>,
    next_id: AtomicU64,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        // A panic while holding the lock cannot leave the counters half
        // updated, so a poisoned guard is still consistent.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_in(&self, client: PooledClient) {
        let id = client.id;
        let mut slots = self.slots();
        if slots.idle.len() < self.config.max_active {
            slots.idle.push_back(client);
            debug!(client_id = id, idle = slots.idle.len(), "client returned to pool");
        } else {
            slots.live -= 1;
            debug!(client_id = id, "idle queue full, dropping client");
        }
    }

    fn discard(&self, id: u64) {
        let mut slots = self.slots();
        slots.live -= 1;
        debug!(client_id = id, live = slots.live, "client discarded");
    }
}

/// Bounded pool of outbound HTTP clients. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ClientPool {
    shared: Arc<Shared>,
}

impl ClientPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.max_active == 0 {
            return Err(Error::InvalidConfig(
                "max_active must be greater than 0".into(),
            ));
        }
        info!(
            max_active = config.max_active,
            max_idle = config.max_idle,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "client pool initialized"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                slots: Mutex::new(Slots {
                    idle: VecDeque::new(),
                    live: 0,
                }),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// Check out a client without waiting.
    ///
    /// Reuses an idle client when one is queued, otherwise builds a new one
    /// if fewer than `max_active` exist. Fails with `PoolExhausted` at the cap.
    pub fn acquire(&self) -> Result<Lease> {
        {
            let mut slots = self.shared.slots();
            if let Some(client) = slots.idle.pop_front() {
                return Ok(Lease::new(client, self.shared.clone()));
            }
            if slots.live >= self.shared.config.max_active {
                warn!(
                    max_active = self.shared.config.max_active,
                    "client pool exhausted"
                );
                return Err(Error::PoolExhausted {
                    max_active: self.shared.config.max_active,
                });
            }
            // Reserve the slot before building so concurrent callers see it.
            slots.live += 1;
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        match self.build_http() {
            Ok(http) => {
                debug!(client_id = id, "built new pooled client");
                Ok(Lease::new(PooledClient { id, http }, self.shared.clone()))
            }
            Err(e) => {
                self.shared.discard(id);
                Err(Error::Build(e))
            }
        }
    }

    /// Acquire a client, execute `request`, and hand back the response
    /// together with the lease.
    ///
    /// The caller releases the lease once it has finished with the response
    /// body. On a transport failure the lease is dropped here, which discards
    /// the client and frees its slot.
    pub async fn forward(&self, request: reqwest::Request) -> Result<Forwarded> {
        let lease = self.acquire()?;
        match lease.client().http().execute(request).await {
            Ok(response) => Ok(Forwarded { response, lease }),
            Err(e) => {
                debug!(client_id = lease.client().id(), error = %e, "upstream call failed");
                drop(lease);
                Err(Error::Transport(e))
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.shared.slots();
        PoolStats {
            live: slots.live,
            idle: slots.idle.len(),
            checked_out: slots.live - slots.idle.len(),
            max_active: self.shared.config.max_active,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    fn build_http(&self) -> reqwest::Result<reqwest::Client> {
        let config = &self.shared.config;
        reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_idle)
            .pool_idle_timeout(config.idle_timeout)
            .timeout(config.request_timeout)
            .build()
    }
}

/// Checkout of a single pooled client.
///
/// `release` gives the client back for reuse. Dropping the lease instead
/// discards the client and frees its slot.
pub struct Lease {
    client: PooledClient,
    slot: Slot,
}

impl Lease {
    fn new(client: PooledClient, shared: Arc<Shared>) -> Self {
        let id = client.id;
        Self {
            client,
            slot: Slot {
                shared,
                id,
                armed: true,
            },
        }
    }

    pub fn client(&self) -> &PooledClient {
        &self.client
    }

    /// Return the client to the idle queue.
    pub fn release(self) {
        let Lease { client, mut slot } = self;
        slot.armed = false;
        slot.shared.check_in(client);
    }
}

/// Discards the slot on drop unless the lease was released.
struct Slot {
    shared: Arc<Shared>,
    id: u64,
    armed: bool,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.armed {
            self.shared.discard(self.id);
        }
    }
}

/// An upstream response that still holds the client that produced it.
pub struct Forwarded {
    pub response: reqwest::Response,
    pub lease: Lease,
}

impl Forwarded {
    pub fn status(&self) -> reqwest::StatusCode {
        self.response.status()
    }

    /// Drop the response without reading it and return the client.
    pub fn release(self) {
        let Forwarded { response, lease } = self;
        drop(response);
        lease.release();
    }
}
