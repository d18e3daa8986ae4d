//! Configuration types for Fabrica
//!
//! Plain serde structures with defaults. Loading them from files or the
//! environment is the embedder's job.

use crate::types::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FabricaConfig {
    /// Active storage backend
    pub backend: BackendKind,
    /// Store configuration
    pub store: StoreConfig,
    /// Metadata cache configuration
    pub cache: CacheConfig,
    /// Reconciliation configuration
    pub reconcile: ReconcileConfig,
    /// Query translator configuration
    pub query: QueryConfig,
}

impl Default for FabricaConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Relational,
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            reconcile: ReconcileConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

/// Durable store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the backing database file
    pub data_path: PathBuf,
    /// Connection attempts before giving up
    pub connect_attempts: u32,
    /// Delay between connection attempts
    #[serde(with = "duration_millis")]
    pub connect_retry_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("/var/lib/fabrica/store.redb"),
            connect_attempts: 10,
            connect_retry_delay: Duration::from_millis(500),
        }
    }
}

/// Metadata cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Name of the cluster-wide reload lock
    pub reload_lock_name: String,
    /// TTL of the reload lock
    #[serde(with = "duration_millis")]
    pub reload_lock_ttl: Duration,
    /// Broadcast channel for compiled metadata
    pub broadcast_channel: String,
    /// Shared cache key for the serialized compiled view
    pub shared_cache_key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reload_lock_name: "metadata-reload".to_string(),
            reload_lock_ttl: Duration::from_secs(10),
            broadcast_channel: "fabrica:metadata".to_string(),
            shared_cache_key: "fabrica:metadata:compiled".to_string(),
        }
    }
}

/// Reconciliation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Name of the cluster-wide reconcile lock
    pub lock_name: String,
    /// TTL of the reconcile lock
    #[serde(with = "duration_millis")]
    pub lock_ttl: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            lock_name: "schema-reconcile".to_string(),
            lock_ttl: Duration::from_secs(30),
        }
    }
}

/// Query translator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Limit applied when a query spec carries none (0 = unbounded)
    pub default_limit: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { default_limit: 100 }
    }
}

/// Durations serialized as integer milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(value.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FabricaConfig::default();
        assert_eq!(config.backend, BackendKind::Relational);
        assert_eq!(config.cache.reload_lock_name, "metadata-reload");
        assert_eq!(config.reconcile.lock_name, "schema-reconcile");
        assert_eq!(config.query.default_limit, 100);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = FabricaConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: FabricaConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.store.connect_attempts, config.store.connect_attempts);
        assert_eq!(parsed.cache.reload_lock_ttl, config.cache.reload_lock_ttl);
    }
}
