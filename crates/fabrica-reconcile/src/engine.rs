//! The reconciliation engine
//!
//! Serializes runs cluster-wide behind a named lock, loads the stored
//! definitions, expands and diffs the snapshot, applies the change set
//! through the storage adapter, then runs the per-column physical enum
//! sync. Phase failures in the transactional part roll the whole run
//! back; enum sync failures are isolated per column and reported.

use crate::diff::diff_snapshot;
use crate::expand::expand_relations;
use crate::report::{EnumSyncFailure, ReconcileReport};
use crate::snapshot::SchemaSnapshot;
use fabrica_common::{Error, InstanceId, ReconcileConfig, Result, epoch_millis};
use fabrica_coord::Coordinator;
use fabrica_store::StorageAdapter;
use std::sync::Arc;
use tracing::{info, warn};

/// Schema reconciliation entry point
pub struct Reconciler {
    adapter: Arc<dyn StorageAdapter>,
    coordinator: Arc<dyn Coordinator>,
    config: ReconcileConfig,
    holder_id: String,
}

impl Reconciler {
    /// Create a reconciler for one process instance
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        coordinator: Arc<dyn Coordinator>,
        config: ReconcileConfig,
        instance: &InstanceId,
    ) -> Self {
        Self {
            adapter,
            coordinator,
            config,
            holder_id: instance.as_str().to_string(),
        }
    }

    /// Reconcile the store against a declarative snapshot.
    ///
    /// Returns `LockUnavailable` when another instance is already
    /// reconciling; that is a signal, not a failure.
    pub async fn reconcile(&self, snapshot: &SchemaSnapshot) -> Result<ReconcileReport> {
        let acquired = self
            .coordinator
            .acquire_lock(&self.config.lock_name, &self.holder_id, self.config.lock_ttl)
            .await?;
        if !acquired {
            info!(lock = %self.config.lock_name, "another instance is reconciling");
            return Err(Error::LockUnavailable(self.config.lock_name.clone()));
        }

        let outcome = self.run(snapshot).await;

        self.coordinator
            .release_lock(&self.config.lock_name, &self.holder_id)
            .await?;
        outcome
    }

    async fn run(&self, snapshot: &SchemaSnapshot) -> Result<ReconcileReport> {
        let started_at = epoch_millis();
        let existing = self.adapter.load_definitions().await?;
        let expanded = expand_relations(snapshot);
        let diff = diff_snapshot(snapshot, &expanded, &existing);

        for entry in &diff.skipped {
            warn!(
                table = %entry.table,
                relation = entry.relation.as_deref().unwrap_or("-"),
                reason = %entry.reason,
                "reconciliation entry skipped"
            );
        }

        // Phases 1-3 run under the backend's transaction semantics; any
        // failure here leaves the store unchanged.
        let counts = self.adapter.apply_schema(&diff.changes).await?;

        // Phase 4 is best-effort per column.
        let mut enum_sync_failures = Vec::new();
        for (table_name, column) in &diff.enum_syncs {
            if let Err(e) = self.adapter.sync_enum_options(table_name, column).await {
                warn!(
                    table = %table_name,
                    column = %column.name,
                    error = %e,
                    "physical enum sync failed"
                );
                enum_sync_failures.push(EnumSyncFailure {
                    table: table_name.clone(),
                    column: column.name.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let report = ReconcileReport {
            started_at,
            finished_at: epoch_millis(),
            counts,
            skipped: diff.skipped,
            enum_sync_failures,
        };
        info!(
            writes = report.counts.total(),
            skipped = report.skipped.len(),
            "reconciliation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ColumnSpec, RelationSpec, TableSpec};
    use fabrica_common::StoreConfig;
    use fabrica_coord::LocalCoordinator;
    use fabrica_store::{DataType, RelationKind, RelationalStore};

    async fn reconciler_with(
        dir: &tempfile::TempDir,
    ) -> (Arc<RelationalStore>, Arc<LocalCoordinator>, Reconciler) {
        let config = StoreConfig {
            data_path: dir.path().join("store.redb"),
            ..StoreConfig::default()
        };
        let store = Arc::new(RelationalStore::open(&config).await.unwrap());
        let coordinator = Arc::new(LocalCoordinator::new());
        let reconciler = Reconciler::new(
            store.clone(),
            coordinator.clone(),
            ReconcileConfig::default(),
            &InstanceId::from_name("test-node"),
        );
        (store, coordinator, reconciler)
    }

    fn user_snapshot(columns: &[&str]) -> SchemaSnapshot {
        let mut table = TableSpec::new("user").with_column(ColumnSpec::primary("id", DataType::Uuid));
        for name in columns {
            table = table.with_column(ColumnSpec::new(*name, DataType::Varchar));
        }
        SchemaSnapshot::new().with_table(table)
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _coord, reconciler) = reconciler_with(&dir).await;
        let snapshot = user_snapshot(&["name", "email"]);

        let first = reconciler.reconcile(&snapshot).await.unwrap();
        assert_eq!(first.counts.tables_created, 1);
        assert_eq!(first.counts.columns_created, 3);

        let second = reconciler.reconcile(&snapshot).await.unwrap();
        assert!(second.is_noop(), "second run wrote: {:?}", second.counts);
    }

    #[tokio::test]
    async fn test_column_retirement() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _coord, reconciler) = reconciler_with(&dir).await;

        reconciler
            .reconcile(&user_snapshot(&["name", "email"]))
            .await
            .unwrap();
        let report = reconciler.reconcile(&user_snapshot(&["name"])).await.unwrap();
        assert_eq!(report.counts.columns_removed, 1);

        let defs = store.load_definitions().await.unwrap();
        let user = defs.table_by_name("user").unwrap();
        assert!(defs.columns_of(user).all(|c| c.name != "email"));
    }

    #[tokio::test]
    async fn test_inverse_relations_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _coord, reconciler) = reconciler_with(&dir).await;

        let snapshot = SchemaSnapshot::new()
            .with_table(
                TableSpec::new("post")
                    .with_column(ColumnSpec::primary("id", DataType::Int))
                    .with_relation(
                        RelationSpec::new("author", RelationKind::ManyToOne, "user")
                            .with_inverse("posts"),
                    ),
            )
            .with_table(TableSpec::new("user").with_column(ColumnSpec::primary("id", DataType::Int)));
        reconciler.reconcile(&snapshot).await.unwrap();

        let defs = store.load_definitions().await.unwrap();
        let user = defs.table_by_name("user").unwrap();
        let inverse: Vec<_> = defs.relations_of(user).collect();
        assert_eq!(inverse.len(), 1);
        assert_eq!(inverse[0].property_name, "posts");
        assert_eq!(inverse[0].kind, RelationKind::OneToMany);
        assert!(inverse[0].is_generated);
        assert_eq!(inverse[0].inverse_property_name.as_deref(), Some("author"));
        assert_eq!(inverse[0].foreign_key_column.as_deref(), Some("author_id"));
    }

    #[tokio::test]
    async fn test_missing_target_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _coord, reconciler) = reconciler_with(&dir).await;

        let snapshot = SchemaSnapshot::new().with_table(
            TableSpec::new("post")
                .with_column(ColumnSpec::primary("id", DataType::Int))
                .with_relation(RelationSpec::new("author", RelationKind::ManyToOne, "user")),
        );
        let report = reconciler.reconcile(&snapshot).await.unwrap();
        assert_eq!(report.counts.tables_created, 1);
        assert!(report.has_issues());
        assert_eq!(report.skipped.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_is_a_signal() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, coordinator, reconciler) = reconciler_with(&dir).await;

        let config = ReconcileConfig::default();
        assert!(
            coordinator
                .acquire_lock(&config.lock_name, "someone-else", config.lock_ttl)
                .await
                .unwrap()
        );
        let err = reconciler
            .reconcile(&user_snapshot(&["name"]))
            .await
            .unwrap_err();
        assert!(err.is_lock_signal());
    }

    #[tokio::test]
    async fn test_lock_released_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _coord, reconciler) = reconciler_with(&dir).await;
        reconciler.reconcile(&user_snapshot(&["name"])).await.unwrap();
        // A second run acquires the lock again without contention.
        reconciler.reconcile(&user_snapshot(&["name"])).await.unwrap();
    }
}
