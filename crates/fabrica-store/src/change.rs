//! Schema change sets
//!
//! The differ's output and the adapters' input: the minimal set of
//! definition writes that makes the store match a snapshot. Entries carry
//! the resolved table name alongside the definition row so an adapter can
//! manage the physical collection without a metadata read-back.

use crate::definitions::{ColumnDefinition, RelationDefinition, TableDefinition};
use serde::{Deserialize, Serialize};

/// A table create/update
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableChange {
    pub table: TableDefinition,
}

/// A column create/update/delete with its owning table resolved
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnChange {
    pub column: ColumnDefinition,
    pub table_name: String,
}

/// A relation create/update/delete with its source table resolved
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationChange {
    pub relation: RelationDefinition,
    pub source_table_name: String,
}

/// The minimal write set produced by one reconciliation diff
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchemaChangeSet {
    pub create_tables: Vec<TableChange>,
    pub update_tables: Vec<TableChange>,
    /// Only junction tables are ever retired implicitly
    pub delete_tables: Vec<TableChange>,
    pub create_columns: Vec<ColumnChange>,
    pub update_columns: Vec<ColumnChange>,
    pub delete_columns: Vec<ColumnChange>,
    pub create_relations: Vec<RelationChange>,
    pub update_relations: Vec<RelationChange>,
    pub delete_relations: Vec<RelationChange>,
}

impl SchemaChangeSet {
    /// Whether applying this change set would perform zero writes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.create_tables.is_empty()
            && self.update_tables.is_empty()
            && self.delete_tables.is_empty()
            && self.create_columns.is_empty()
            && self.update_columns.is_empty()
            && self.delete_columns.is_empty()
            && self.create_relations.is_empty()
            && self.update_relations.is_empty()
            && self.delete_relations.is_empty()
    }

    /// Total number of pending writes
    #[must_use]
    pub fn len(&self) -> usize {
        self.create_tables.len()
            + self.update_tables.len()
            + self.delete_tables.len()
            + self.create_columns.len()
            + self.update_columns.len()
            + self.delete_columns.len()
            + self.create_relations.len()
            + self.update_relations.len()
            + self.delete_relations.len()
    }
}

/// Write counts reported back by an adapter after applying a change set
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedCounts {
    pub tables_created: u64,
    pub tables_updated: u64,
    pub tables_removed: u64,
    pub columns_created: u64,
    pub columns_updated: u64,
    pub columns_removed: u64,
    pub relations_created: u64,
    pub relations_updated: u64,
    pub relations_removed: u64,
}

impl AppliedCounts {
    /// Whether the apply performed zero writes
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.tables_created == 0
            && self.tables_updated == 0
            && self.tables_removed == 0
            && self.columns_created == 0
            && self.columns_updated == 0
            && self.columns_removed == 0
            && self.relations_created == 0
            && self.relations_updated == 0
            && self.relations_removed == 0
    }

    /// Total writes performed
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.tables_created
            + self.tables_updated
            + self.tables_removed
            + self.columns_created
            + self.columns_updated
            + self.columns_removed
            + self.relations_created
            + self.relations_updated
            + self.relations_removed
    }

    /// Counts derived from the change set itself (adapters apply the whole
    /// set or nothing, so the counts are known up front)
    #[must_use]
    pub fn from_change_set(changes: &SchemaChangeSet) -> Self {
        Self {
            tables_created: changes.create_tables.len() as u64,
            tables_updated: changes.update_tables.len() as u64,
            tables_removed: changes.delete_tables.len() as u64,
            columns_created: changes.create_columns.len() as u64,
            columns_updated: changes.update_columns.len() as u64,
            columns_removed: changes.delete_columns.len() as u64,
            relations_created: changes.create_relations.len() as u64,
            relations_updated: changes.update_relations.len() as u64,
            relations_removed: changes.delete_relations.len() as u64,
        }
    }
}
