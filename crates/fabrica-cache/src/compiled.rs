//! Compiled metadata
//!
//! The query-ready materialization of the stored definitions: tables
//! keyed by name, every relation resolved to table names, and the two
//! implicit system timestamp columns injected where absent. A compiled
//! view is immutable once built; reloads replace it wholesale.

use fabrica_common::{ColumnId, TableId, epoch_millis};
use fabrica_store::{
    ColumnDefinition, DataType, JunctionNames, PkGeneration, RelationKind, StoredDefinitions,
    WriteTarget,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Names of the implicit system timestamp columns
pub const SYSTEM_COLUMNS: [&str; 2] = ["created_at", "updated_at"];

/// One relation with both endpoints resolved to table names
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledRelation {
    pub property_name: String,
    pub kind: RelationKind,
    pub source_table: String,
    pub target_table: String,
    pub inverse_property_name: Option<String>,
    pub is_nullable: bool,
    pub is_generated: bool,
    pub foreign_key_column: Option<String>,
    pub junction: Option<JunctionNames>,
}

impl CompiledRelation {
    /// Whether the foreign key lives on the target table: true for
    /// one-to-many and for synthesized one-to-one inverses, whose
    /// declared side holds the physical key.
    #[must_use]
    pub const fn foreign_key_on_target(&self) -> bool {
        match self.kind {
            RelationKind::OneToMany => true,
            RelationKind::OneToOne => self.is_generated,
            RelationKind::ManyToOne | RelationKind::ManyToMany => false,
        }
    }
}

/// One table with its full column and relation lists
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledTable {
    pub id: TableId,
    pub name: String,
    pub alias: Option<String>,
    pub description: Option<String>,
    pub is_system: bool,
    pub uniques: Vec<Vec<String>>,
    pub indexes: Vec<Vec<String>>,
    pub columns: Vec<ColumnDefinition>,
    pub relations: Vec<CompiledRelation>,
}

impl CompiledTable {
    /// Find a column by name
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Find a relation by property name
    #[must_use]
    pub fn relation(&self, property: &str) -> Option<&CompiledRelation> {
        self.relations.iter().find(|r| r.property_name == property)
    }

    /// The primary-key column, if one is declared
    #[must_use]
    pub fn primary_key(&self) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.is_primary)
    }

    /// Scalar columns visible to wildcard field expansion
    pub fn visible_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter().filter(|c| !c.is_hidden)
    }

    /// Write-side addressing for this table
    #[must_use]
    pub fn write_target(&self) -> WriteTarget {
        let (primary_key, generation) = self.primary_key().map_or_else(
            || ("id".to_string(), PkGeneration::Provided),
            |pk| {
                let generation = if !pk.is_generated {
                    PkGeneration::Provided
                } else if pk.data_type == DataType::Uuid {
                    PkGeneration::Uuid
                } else {
                    PkGeneration::Sequence
                };
                (pk.name.clone(), generation)
            },
        );
        WriteTarget {
            table: self.name.clone(),
            primary_key,
            generation,
        }
    }
}

/// The whole compiled view, replaced atomically on reload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledMetadata {
    /// Monotonic per-cluster reload counter
    pub version: u64,
    /// When this view was built (epoch millis)
    pub built_at: u64,
    tables: BTreeMap<String, CompiledTable>,
}

impl CompiledMetadata {
    /// An empty view (version zero, no tables)
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: 0,
            built_at: epoch_millis(),
            tables: BTreeMap::new(),
        }
    }

    /// Look up a table by name
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&CompiledTable> {
        self.tables.get(name)
    }

    /// Look up a table by id
    #[must_use]
    pub fn table_by_id(&self, id: TableId) -> Option<&CompiledTable> {
        self.tables.values().find(|t| t.id == id)
    }

    /// Iterate tables in name order
    pub fn tables(&self) -> impl Iterator<Item = &CompiledTable> {
        self.tables.values()
    }

    /// Table names in order
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Number of compiled tables
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the view has no tables
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Rebuild with one table replaced/added; used by the synthesis pass
    #[must_use]
    pub(crate) fn with_table(mut self, table: CompiledTable) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }
}

/// Compile stored definitions into the query-ready form.
///
/// Relations whose target table is missing from the store are dropped
/// with a warning; the two system timestamp columns are injected on
/// every table that does not declare them.
#[must_use]
pub fn compile(defs: &StoredDefinitions, version: u64) -> CompiledMetadata {
    let names_by_id: BTreeMap<TableId, &str> = defs
        .tables
        .iter()
        .map(|t| (t.id, t.name.as_str()))
        .collect();

    let mut tables = BTreeMap::new();
    for table in &defs.tables {
        let mut columns: Vec<ColumnDefinition> = defs.columns_of(table).cloned().collect();
        for system_name in SYSTEM_COLUMNS {
            if !columns.iter().any(|c| c.name == system_name) {
                columns.push(system_column(table.id, system_name));
            }
        }

        let mut relations = Vec::new();
        for relation in defs.relations_of(table) {
            let Some(target_name) = names_by_id.get(&relation.target_table_id) else {
                warn!(
                    table = %table.name,
                    property = %relation.property_name,
                    "relation target missing from store, dropped from compiled view"
                );
                continue;
            };
            relations.push(CompiledRelation {
                property_name: relation.property_name.clone(),
                kind: relation.kind,
                source_table: table.name.clone(),
                target_table: (*target_name).to_string(),
                inverse_property_name: relation.inverse_property_name.clone(),
                is_nullable: relation.is_nullable,
                is_generated: relation.is_generated,
                foreign_key_column: relation.foreign_key_column.clone(),
                junction: relation.junction.clone(),
            });
        }

        tables.insert(
            table.name.clone(),
            CompiledTable {
                id: table.id,
                name: table.name.clone(),
                alias: table.alias.clone(),
                description: table.description.clone(),
                is_system: table.is_system,
                uniques: table.uniques.clone(),
                indexes: table.indexes.clone(),
                columns,
                relations,
            },
        );
    }

    CompiledMetadata {
        version,
        built_at: epoch_millis(),
        tables,
    }
}

fn system_column(table_id: TableId, name: &str) -> ColumnDefinition {
    ColumnDefinition {
        id: ColumnId::new(),
        table_id,
        name: name.to_string(),
        data_type: DataType::Timestamp,
        is_primary: false,
        is_generated: true,
        is_nullable: false,
        is_system: true,
        is_updatable: false,
        is_hidden: false,
        default_value: None,
        options: None,
        description: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabrica_store::{RelationDefinition, TableDefinition};

    fn defs_with_relation() -> StoredDefinitions {
        let post = TableDefinition::new("post");
        let user = TableDefinition::new("user");
        let relation = RelationDefinition {
            id: fabrica_common::RelationId::new(),
            source_table_id: post.id,
            property_name: "author".into(),
            kind: RelationKind::ManyToOne,
            target_table_id: user.id,
            inverse_property_name: Some("posts".into()),
            is_nullable: true,
            is_system: false,
            is_generated: false,
            foreign_key_column: Some("author_id".into()),
            junction: None,
        };
        let mut defs = StoredDefinitions::default();
        let id_col = ColumnDefinition::new(post.id, "id", DataType::Int);
        defs.columns.push(id_col);
        defs.tables.push(post);
        defs.tables.push(user);
        defs.relations.push(relation);
        defs
    }

    #[test]
    fn test_system_columns_injected() {
        let meta = compile(&defs_with_relation(), 1);
        let post = meta.table("post").unwrap();
        assert!(post.column("created_at").unwrap().is_system);
        assert!(post.column("updated_at").unwrap().is_system);
        // Declared columns are kept as-is
        assert!(!post.column("id").unwrap().is_system);
        assert_eq!(post.columns.len(), 3);
    }

    #[test]
    fn test_relations_resolved_to_names() {
        let meta = compile(&defs_with_relation(), 1);
        let author = meta.table("post").unwrap().relation("author").unwrap();
        assert_eq!(author.target_table, "user");
        assert!(!author.foreign_key_on_target());
    }

    #[test]
    fn test_dangling_relation_dropped() {
        let mut defs = defs_with_relation();
        defs.tables.retain(|t| t.name != "user");
        let meta = compile(&defs, 1);
        assert!(meta.table("post").unwrap().relations.is_empty());
    }

    #[test]
    fn test_write_target_from_primary_key() {
        let mut defs = defs_with_relation();
        if let Some(pk) = defs.columns.first_mut() {
            pk.is_primary = true;
            pk.is_generated = true;
        }
        let meta = compile(&defs, 1);
        let target = meta.table("post").unwrap().write_target();
        assert_eq!(target.primary_key, "id");
        assert_eq!(target.generation, PkGeneration::Sequence);
    }

    #[test]
    fn test_serializes_for_broadcast() {
        let meta = compile(&defs_with_relation(), 3);
        let json = serde_json::to_string(&meta).unwrap();
        let parsed: CompiledMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.len(), meta.len());
        assert_eq!(
            parsed.table("post").unwrap().relations,
            meta.table("post").unwrap().relations
        );
    }
}
