//! Storage adapter contract
//!
//! The reconciliation engine and the query translator depend on this
//! trait only; the backend choice is made once at bootstrap. Plans and
//! change sets are self-contained, so implementations never reach back
//! into the metadata cache.

use crate::change::{AppliedCounts, SchemaChangeSet};
use crate::definitions::{
    ColumnDefinition, JunctionNames, RelationDefinition, TableDefinition,
};
use crate::plan::{FilterNode, Record, SelectPlan, WriteTarget};
use async_trait::async_trait;
use fabrica_common::{BackendKind, Result};
use serde_json::Value;

/// The full contents of the three metadata collections
#[derive(Clone, Debug, Default)]
pub struct StoredDefinitions {
    pub tables: Vec<TableDefinition>,
    pub columns: Vec<ColumnDefinition>,
    pub relations: Vec<RelationDefinition>,
}

impl StoredDefinitions {
    /// Find a table by name
    #[must_use]
    pub fn table_by_name(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Columns owned by a table
    pub fn columns_of(&self, table: &TableDefinition) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter().filter(move |c| c.table_id == table.id)
    }

    /// Relations declared on a table
    pub fn relations_of(
        &self,
        table: &TableDefinition,
    ) -> impl Iterator<Item = &RelationDefinition> {
        self.relations
            .iter()
            .filter(move |r| r.source_table_id == table.id)
    }
}

/// One storage backend: metadata collections plus the data path
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Which backend family this adapter is
    fn kind(&self) -> BackendKind;

    // ---- Metadata collections ----

    /// Load all three definition collections
    async fn load_definitions(&self) -> Result<StoredDefinitions>;

    /// Apply a schema change set under this backend's write semantics:
    /// all-or-nothing on the relational engine, a best-effort sequence
    /// with compensation on the document engine.
    async fn apply_schema(&self, changes: &SchemaChangeSet) -> Result<AppliedCounts>;

    /// Align the physical value set of an enum column (relational only;
    /// the document engine stores no physical constraint and no-ops).
    async fn sync_enum_options(&self, table_name: &str, column: &ColumnDefinition) -> Result<()>;

    // ---- Data path ----

    /// Execute a resolved select plan
    async fn fetch(&self, plan: &SelectPlan) -> Result<Vec<Record>>;

    /// Count records matching a filter
    async fn count(&self, table_name: &str, filter: Option<&FilterNode>) -> Result<u64>;

    /// Insert one row, generating the primary key if the target says so.
    /// Returns the primary-key value.
    async fn insert_row(&self, target: &WriteTarget, row: Record) -> Result<Value>;

    /// Merge `changes` into every row matching `filter`; returns the
    /// affected count.
    async fn update_rows(
        &self,
        target: &WriteTarget,
        filter: &FilterNode,
        changes: Record,
    ) -> Result<u64>;

    /// Delete every row matching `filter`; returns the removed count.
    async fn delete_rows(&self, target: &WriteTarget, filter: &FilterNode) -> Result<u64>;

    // ---- Junction maintenance ----

    /// Replace the junction rows for one owner with exactly `targets`
    /// (clear-then-insert, not diff-merge).
    async fn replace_junction(
        &self,
        junction: &JunctionNames,
        owner: &Value,
        targets: &[Value],
    ) -> Result<()>;

    /// Remove all junction rows for one owner; returns the removed count.
    async fn clear_junction(&self, junction: &JunctionNames, owner: &Value) -> Result<u64>;

    /// Target keys currently linked to one owner.
    async fn junction_targets(&self, junction: &JunctionNames, owner: &Value) -> Result<Vec<Value>>;
}
