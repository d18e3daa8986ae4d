//! In-process coordinator
//!
//! Backs the coordination contract with process-local state: DashMap
//! tables for locks and the cache, and a tokio broadcast channel per
//! topic. Single-node deployments and tests run on this implementation;
//! expiry is checked lazily on access, so no sweeper task is needed.

use crate::coordinator::{Coordinator, Payload, Subscription};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fabrica_common::{Result, epoch_millis};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

/// Broadcast channel depth per topic
const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
struct LockEntry {
    holder: String,
    expires_at: u64,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        epoch_millis() >= self.expires_at
    }
}

#[derive(Clone)]
struct CacheEntry {
    value: Payload,
    /// `None` = no expiry
    expires_at: Option<u64>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| epoch_millis() >= at)
    }
}

/// In-process implementation of [`Coordinator`]
pub struct LocalCoordinator {
    locks: DashMap<String, LockEntry>,
    cache: DashMap<String, CacheEntry>,
    channels: DashMap<String, broadcast::Sender<Payload>>,
}

impl LocalCoordinator {
    /// Create an empty coordinator
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            cache: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Payload> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for LocalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    async fn acquire_lock(&self, name: &str, holder_id: &str, ttl: Duration) -> Result<bool> {
        let expires_at = epoch_millis().saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        match self.locks.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(LockEntry {
                    holder: holder_id.to_string(),
                    expires_at,
                });
                trace!(lock = name, holder = holder_id, "lock acquired");
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.holder == holder_id || current.is_expired() {
                    slot.insert(LockEntry {
                        holder: holder_id.to_string(),
                        expires_at,
                    });
                    trace!(lock = name, holder = holder_id, "lock acquired");
                    Ok(true)
                } else {
                    trace!(lock = name, holder = holder_id, current = %current.holder, "lock busy");
                    Ok(false)
                }
            }
        }
    }

    async fn release_lock(&self, name: &str, holder_id: &str) -> Result<()> {
        self.locks
            .remove_if(name, |_, entry| entry.holder == holder_id);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Payload) -> Result<()> {
        // A send error only means there are no subscribers yet.
        let _ = self.sender_for(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        Ok(Subscription::new(self.sender_for(channel).subscribe()))
    }

    async fn cache_get(&self, key: &str) -> Result<Option<Payload>> {
        if let Some(entry) = self.cache.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.cache.remove_if(key, |_, e| e.is_expired());
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn cache_set(&self, key: &str, value: Payload, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|t| {
            epoch_millis().saturating_add(u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
        });
        self.cache
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn cache_delete(&self, key: &str) -> Result<()> {
        self.cache.remove(key);
        Ok(())
    }
}
