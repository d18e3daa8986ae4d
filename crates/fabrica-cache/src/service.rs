//! The metadata cache service
//!
//! One cache instance per process. Reads serve the local compiled view;
//! a cold instance falls back to the shared cache, then to a
//! load-and-compile from the durable store. Reloads are serialized
//! cluster-wide by a named TTL lock, and the winning instance publishes
//! the compiled view so peers install it without re-querying the store.

use crate::compiled::{CompiledMetadata, CompiledTable, compile};
use crate::synthesis::synthesize_inverses;
use fabrica_common::{CacheConfig, InstanceId, Result};
use fabrica_coord::Coordinator;
use fabrica_store::StorageAdapter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a reload attempt
#[derive(Debug)]
pub enum ReloadOutcome {
    /// This instance rebuilt and published the compiled view
    Reloaded(Arc<CompiledMetadata>),
    /// Another instance holds the reload lock; the broadcast will arrive
    PeerReloading,
}

/// Broadcast payload: the compiled view tagged with its origin instance
#[derive(Serialize, Deserialize)]
struct BroadcastEnvelope {
    origin: String,
    metadata: CompiledMetadata,
}

/// Cluster-consistent compiled metadata cache
pub struct MetadataCache {
    adapter: Arc<dyn StorageAdapter>,
    coordinator: Arc<dyn Coordinator>,
    config: CacheConfig,
    instance: InstanceId,
    current: RwLock<Option<Arc<CompiledMetadata>>>,
}

impl MetadataCache {
    /// Create a cache instance; the embedder owns its lifecycle and
    /// should call [`Self::run_subscriber`] once at startup.
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        coordinator: Arc<dyn Coordinator>,
        config: CacheConfig,
        instance: InstanceId,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            coordinator,
            config,
            instance,
            current: RwLock::new(None),
        })
    }

    /// The compiled view, loading and caching it on a cold instance.
    pub async fn get_metadata(&self) -> Result<Arc<CompiledMetadata>> {
        if let Some(meta) = self.current.read().clone() {
            return Ok(meta);
        }

        // A peer may already have built the view; the shared cache is
        // cheaper than a store load and compile.
        if let Some(bytes) = self
            .coordinator
            .cache_get(&self.config.shared_cache_key)
            .await?
        {
            match serde_json::from_slice::<CompiledMetadata>(&bytes) {
                Ok(meta) => {
                    debug!(version = meta.version, "compiled view adopted from shared cache");
                    let meta = Arc::new(meta);
                    *self.current.write() = Some(meta.clone());
                    return Ok(meta);
                }
                Err(e) => warn!("shared cache payload unreadable, recompiling: {e}"),
            }
        }

        let meta = self.load_and_compile(1).await?;
        self.coordinator
            .cache_set(
                &self.config.shared_cache_key,
                serde_json::to_vec(meta.as_ref())?,
                None,
            )
            .await?;
        *self.current.write() = Some(meta.clone());
        Ok(meta)
    }

    /// One compiled table by name.
    pub async fn get_table(&self, name: &str) -> Result<Option<CompiledTable>> {
        Ok(self.get_metadata().await?.table(name).cloned())
    }

    /// Force a fresh load-and-publish cycle.
    ///
    /// At most one instance reloads at a time; losing the lock race is
    /// the normal `PeerReloading` outcome, not an error.
    pub async fn reload(&self) -> Result<ReloadOutcome> {
        let acquired = self
            .coordinator
            .acquire_lock(
                &self.config.reload_lock_name,
                self.instance.as_str(),
                self.config.reload_lock_ttl,
            )
            .await?;
        if !acquired {
            info!(lock = %self.config.reload_lock_name, "peer instance is reloading");
            return Ok(ReloadOutcome::PeerReloading);
        }

        let built = async {
            let next_version = self.current.read().as_ref().map_or(0, |m| m.version) + 1;
            let meta = self.load_and_compile(next_version).await?;
            self.coordinator
                .cache_set(
                    &self.config.shared_cache_key,
                    serde_json::to_vec(meta.as_ref())?,
                    None,
                )
                .await?;
            Ok::<_, fabrica_common::Error>(meta)
        }
        .await;

        self.coordinator
            .release_lock(&self.config.reload_lock_name, self.instance.as_str())
            .await?;
        let meta = built?;

        *self.current.write() = Some(meta.clone());
        let envelope = BroadcastEnvelope {
            origin: self.instance.as_str().to_string(),
            metadata: meta.as_ref().clone(),
        };
        self.coordinator
            .publish(&self.config.broadcast_channel, serde_json::to_vec(&envelope)?)
            .await?;
        info!(version = meta.version, tables = meta.len(), "compiled view published");
        Ok(ReloadOutcome::Reloaded(meta))
    }

    /// Drop the local view; the next read repopulates it.
    pub fn invalidate(&self) {
        *self.current.write() = None;
    }

    /// Subscribe to peer publications. Runs until the channel closes;
    /// call once at process startup.
    pub async fn run_subscriber(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut subscription = self
            .coordinator
            .subscribe(&self.config.broadcast_channel)
            .await?;
        let cache = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                cache.handle_broadcast(&payload).await;
            }
            debug!("metadata broadcast channel closed");
        }))
    }

    async fn handle_broadcast(&self, payload: &[u8]) {
        let envelope = match serde_json::from_slice::<BroadcastEnvelope>(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("unreadable metadata broadcast, ignoring: {e}");
                return;
            }
        };
        if envelope.origin == self.instance.as_str() {
            return;
        }
        let meta = Arc::new(envelope.metadata);
        info!(
            version = meta.version,
            origin = %envelope.origin,
            "installing compiled view from broadcast"
        );
        *self.current.write() = Some(meta.clone());
        // Write-through so instances joining later see the same view
        // without hitting the store.
        match serde_json::to_vec(meta.as_ref()) {
            Ok(bytes) => {
                if let Err(e) = self
                    .coordinator
                    .cache_set(&self.config.shared_cache_key, bytes, None)
                    .await
                {
                    warn!("shared cache write-through failed: {e}");
                }
            }
            Err(e) => warn!("compiled view serialization failed: {e}"),
        }
    }

    async fn load_and_compile(&self, version: u64) -> Result<Arc<CompiledMetadata>> {
        let defs = self.adapter.load_definitions().await?;
        let compiled = compile(&defs, version);
        // Reconciliation persists inverses, but the store may have been
        // touched outside it.
        Ok(Arc::new(synthesize_inverses(&compiled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabrica_common::{ReconcileConfig, StoreConfig};
    use fabrica_coord::LocalCoordinator;
    use fabrica_reconcile::{ColumnSpec, Reconciler, RelationSpec, SchemaSnapshot, TableSpec};
    use fabrica_store::{DataType, RelationKind, RelationalStore};
    use std::time::Duration;

    async fn seeded_store(dir: &tempfile::TempDir) -> Arc<RelationalStore> {
        let config = StoreConfig {
            data_path: dir.path().join("store.redb"),
            ..StoreConfig::default()
        };
        let store = Arc::new(RelationalStore::open(&config).await.unwrap());
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(LocalCoordinator::new()),
            ReconcileConfig::default(),
            &InstanceId::from_name("seeder"),
        );
        let snapshot = SchemaSnapshot::new()
            .with_table(
                TableSpec::new("post")
                    .with_column(ColumnSpec::primary("id", DataType::Int))
                    .with_column(ColumnSpec::new("title", DataType::Varchar))
                    .with_relation(
                        RelationSpec::new("author", RelationKind::ManyToOne, "user")
                            .with_inverse("posts"),
                    ),
            )
            .with_table(
                TableSpec::new("user").with_column(ColumnSpec::primary("id", DataType::Int)),
            );
        reconciler.reconcile(&snapshot).await.unwrap();
        store
    }

    fn cache_on(
        store: &Arc<RelationalStore>,
        coordinator: &Arc<LocalCoordinator>,
        name: &str,
    ) -> Arc<MetadataCache> {
        MetadataCache::new(
            store.clone(),
            coordinator.clone(),
            CacheConfig::default(),
            InstanceId::from_name(name),
        )
    }

    #[tokio::test]
    async fn test_cold_load_compiles_with_inverses() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;
        let coordinator = Arc::new(LocalCoordinator::new());
        let cache = cache_on(&store, &coordinator, "a");

        let meta = cache.get_metadata().await.unwrap();
        assert_eq!(meta.version, 1);
        assert!(meta.table("post").is_some());
        let posts = meta.table("user").unwrap().relation("posts").unwrap();
        assert_eq!(posts.kind, RelationKind::OneToMany);
        // Served from the local view on the second call
        let again = cache.get_metadata().await.unwrap();
        assert_eq!(again.version, 1);
    }

    #[tokio::test]
    async fn test_reload_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;
        let coordinator = Arc::new(LocalCoordinator::new());
        let cache = cache_on(&store, &coordinator, "a");

        cache.get_metadata().await.unwrap();
        let ReloadOutcome::Reloaded(meta) = cache.reload().await.unwrap() else {
            panic!("expected a reload");
        };
        assert_eq!(meta.version, 2);
        assert_eq!(cache.get_metadata().await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_reload_lock_held_means_peer_reloading() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;
        let coordinator = Arc::new(LocalCoordinator::new());
        let cache = cache_on(&store, &coordinator, "a");

        let config = CacheConfig::default();
        coordinator
            .acquire_lock(&config.reload_lock_name, "peer", config.reload_lock_ttl)
            .await
            .unwrap();
        assert!(matches!(
            cache.reload().await.unwrap(),
            ReloadOutcome::PeerReloading
        ));
    }

    #[tokio::test]
    async fn test_broadcast_keeps_peers_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;
        let coordinator = Arc::new(LocalCoordinator::new());
        let a = cache_on(&store, &coordinator, "a");
        let b = cache_on(&store, &coordinator, "b");

        let _handle = b.run_subscriber().await.unwrap();
        let ReloadOutcome::Reloaded(published) = a.reload().await.unwrap() else {
            panic!("expected a reload");
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = b.get_metadata().await.unwrap();
        assert_eq!(seen.version, published.version);
        let a_tables: Vec<_> = published.table_names().collect();
        let b_tables: Vec<_> = seen.table_names().collect();
        assert_eq!(a_tables, b_tables);
    }

    #[tokio::test]
    async fn test_cold_instance_adopts_shared_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;
        let coordinator = Arc::new(LocalCoordinator::new());
        let a = cache_on(&store, &coordinator, "a");
        let b = cache_on(&store, &coordinator, "b");

        a.get_metadata().await.unwrap();
        let ReloadOutcome::Reloaded(published) = a.reload().await.unwrap() else {
            panic!("expected a reload");
        };
        // b never saw the broadcast; the shared cache carries the view.
        let seen = b.get_metadata().await.unwrap();
        assert_eq!(seen.version, published.version);
    }

    #[tokio::test]
    async fn test_invalidate_forces_repopulation() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;
        let coordinator = Arc::new(LocalCoordinator::new());
        let cache = cache_on(&store, &coordinator, "a");

        cache.get_metadata().await.unwrap();
        cache.invalidate();
        let meta = cache.get_metadata().await.unwrap();
        assert!(meta.table("post").is_some());
    }
}
