//! Declarative schema snapshots
//!
//! The snapshot is the reconciliation input: the full desired shape of
//! every administered table, minus generated ids. Snapshots deserialize
//! from JSON, and the builder methods keep test fixtures readable.

use fabrica_store::{DataType, RelationKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Desired schema: table name -> table spec
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    #[serde(flatten)]
    tables: BTreeMap<String, TableSpec>,
}

impl SchemaSnapshot {
    /// An empty snapshot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a table spec, keyed by its name
    #[must_use]
    pub fn with_table(mut self, spec: TableSpec) -> Self {
        self.tables.insert(spec.name.clone(), spec);
        self
    }

    /// Remove a table spec, returning whether it was present
    pub fn remove_table(&mut self, name: &str) -> bool {
        self.tables.remove(name).is_some()
    }

    /// Look up a table spec by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.get(name)
    }

    /// Iterate table specs in name order
    pub fn tables(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.values()
    }

    /// Number of tables declared
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the snapshot declares no tables
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Desired shape of one table
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub uniques: Vec<Vec<String>>,
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub relations: Vec<RelationSpec>,
}

impl TableSpec {
    /// A table spec with only a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            description: None,
            is_system: false,
            uniques: Vec::new(),
            indexes: Vec::new(),
            columns: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Set the display alias
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Add a column
    #[must_use]
    pub fn with_column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a relation
    #[must_use]
    pub fn with_relation(mut self, relation: RelationSpec) -> Self {
        self.relations.push(relation);
        self
    }

    /// Add a unique column group
    #[must_use]
    pub fn with_unique(mut self, columns: Vec<String>) -> Self {
        self.uniques.push(columns);
        self
    }

    /// Find a column spec by name
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Desired shape of one column
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub is_generated: bool,
    #[serde(default = "default_true")]
    pub is_nullable: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default = "default_true")]
    pub is_updatable: bool,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
}

const fn default_true() -> bool {
    true
}

impl ColumnSpec {
    /// A nullable, updatable column
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            is_primary: false,
            is_generated: false,
            is_nullable: true,
            is_system: false,
            is_updatable: true,
            is_hidden: false,
            default_value: None,
            options: None,
            description: None,
        }
    }

    /// A generated primary-key column
    pub fn primary(name: impl Into<String>, data_type: DataType) -> Self {
        let mut spec = Self::new(name, data_type);
        spec.is_primary = true;
        spec.is_generated = true;
        spec.is_nullable = false;
        spec.is_updatable = false;
        spec
    }

    /// Mark not-null
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    /// Mark hidden from wildcard field expansion
    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.is_hidden = true;
        self
    }

    /// Set the enum value list
    #[must_use]
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = Some(options);
        self
    }

    /// Set the default value
    #[must_use]
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// Desired shape of one relation; the target is referenced by table name
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationSpec {
    pub property_name: String,
    pub kind: RelationKind,
    pub target_table: String,
    #[serde(default)]
    pub inverse_property_name: Option<String>,
    #[serde(default = "default_true")]
    pub is_nullable: bool,
}

impl RelationSpec {
    /// A relation of the given kind
    pub fn new(
        property_name: impl Into<String>,
        kind: RelationKind,
        target_table: impl Into<String>,
    ) -> Self {
        Self {
            property_name: property_name.into(),
            kind,
            target_table: target_table.into(),
            inverse_property_name: None,
            is_nullable: true,
        }
    }

    /// Name the inverse property to synthesize on the target
    #[must_use]
    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse_property_name = Some(inverse.into());
        self
    }

    /// Mark not-null
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_builder() {
        let snapshot = SchemaSnapshot::new().with_table(
            TableSpec::new("user")
                .with_column(ColumnSpec::primary("id", DataType::Uuid))
                .with_column(ColumnSpec::new("email", DataType::Varchar))
                .with_unique(vec!["email".into()]),
        );
        assert_eq!(snapshot.len(), 1);
        let user = snapshot.get("user").unwrap();
        assert!(user.column("id").unwrap().is_primary);
        assert_eq!(user.uniques, vec![vec!["email".to_string()]]);
    }

    #[test]
    fn test_snapshot_from_json() {
        let json = serde_json::json!({
            "post": {
                "name": "post",
                "columns": [
                    {"name": "id", "data_type": "int", "is_primary": true},
                    {"name": "title", "data_type": "varchar"}
                ],
                "relations": [
                    {
                        "property_name": "author",
                        "kind": "many_to_one",
                        "target_table": "user",
                        "inverse_property_name": "posts"
                    }
                ]
            }
        });
        let snapshot: SchemaSnapshot = serde_json::from_value(json).unwrap();
        let post = snapshot.get("post").unwrap();
        assert_eq!(post.columns.len(), 2);
        // Defaults fill the omitted flags
        assert!(post.columns[1].is_nullable);
        assert!(post.columns[1].is_updatable);
        assert_eq!(post.relations[0].kind, RelationKind::ManyToOne);
        assert_eq!(
            post.relations[0].inverse_property_name.as_deref(),
            Some("posts")
        );
    }
}
