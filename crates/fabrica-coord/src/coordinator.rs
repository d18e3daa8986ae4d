//! Coordination primitive contract
//!
//! Named locks carry a holder id and a TTL so a crashed holder cannot
//! starve its peers. The cache and publish/subscribe sides move opaque
//! byte payloads; serialization is the caller's concern.

use async_trait::async_trait;
use fabrica_common::Result;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Opaque message/cache payload
pub type Payload = Vec<u8>;

/// Cluster coordination contract consumed by the engine
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Try to acquire the named lock for `holder_id` with the given TTL.
    ///
    /// Returns `true` on acquisition (including re-acquisition by the
    /// current holder, which refreshes the TTL), `false` if another
    /// unexpired holder owns the lock.
    async fn acquire_lock(&self, name: &str, holder_id: &str, ttl: Duration) -> Result<bool>;

    /// Release the named lock if `holder_id` owns it. Releasing a lock
    /// held by someone else (or nobody) is a no-op.
    async fn release_lock(&self, name: &str, holder_id: &str) -> Result<()>;

    /// Publish a payload to every subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: Payload) -> Result<()>;

    /// Subscribe to `channel`. Payloads published after this call are
    /// delivered in publish order.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Read a cache value, if present and unexpired.
    async fn cache_get(&self, key: &str) -> Result<Option<Payload>>;

    /// Write a cache value. `ttl = None` means no expiry.
    async fn cache_set(&self, key: &str, value: Payload, ttl: Option<Duration>) -> Result<()>;

    /// Remove a cache value.
    async fn cache_delete(&self, key: &str) -> Result<()>;
}

/// A live subscription to a broadcast channel
pub struct Subscription {
    inner: broadcast::Receiver<Payload>,
}

impl Subscription {
    /// Wrap a broadcast receiver
    #[must_use]
    pub const fn new(inner: broadcast::Receiver<Payload>) -> Self {
        Self { inner }
    }

    /// Receive the next payload. Returns `None` once the channel is
    /// closed. A lagged receiver skips to the oldest retained message.
    pub async fn recv(&mut self) -> Option<Payload> {
        loop {
            match self.inner.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscription lagged, continuing from oldest");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
