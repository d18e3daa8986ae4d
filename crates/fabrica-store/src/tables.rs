//! Redb table definitions for the durable store
//!
//! The three metadata collections are fixed tables; data collections are
//! opened by derived name at runtime.

use redb::TableDefinition;

// Metadata collections (bincode-encoded definition rows, keyed by id)
pub const TABLE_DEFS: TableDefinition<&str, &[u8]> = TableDefinition::new("meta_tables");
pub const COLUMN_DEFS: TableDefinition<&str, &[u8]> = TableDefinition::new("meta_columns");
pub const RELATION_DEFS: TableDefinition<&str, &[u8]> = TableDefinition::new("meta_relations");

// Physical enum value sets, key "table\x00column" -> JSON array
pub const PHYSICAL_ENUMS: TableDefinition<&str, &[u8]> = TableDefinition::new("physical_enums");

// Per-table insert sequences
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Name of the data collection backing a logical table
#[must_use]
pub fn data_table_name(table: &str) -> String {
    format!("data_{table}")
}

/// Composite key for the physical enum table
#[must_use]
pub fn enum_key(table: &str, column: &str) -> String {
    format!("{table}\x00{column}")
}

/// Composite key for one junction row
#[must_use]
pub fn junction_key(owner: &str, target: &str) -> String {
    format!("{owner}\x00{target}")
}
