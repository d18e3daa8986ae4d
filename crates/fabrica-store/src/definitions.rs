//! Definition rows for the three metadata collections
//!
//! These types are serialized to redb via bincode. The relational backend
//! links columns/relations to their table by foreign reference only; the
//! document backend additionally embeds the owned id arrays on the stored
//! table document.

use crate::naming;
use fabrica_common::{ColumnId, RelationId, TableId};
use serde::{Deserialize, Serialize};

/// Serde wrapper for `Option<serde_json::Value>` (JSON text in bincode,
/// which cannot carry self-describing values)
mod json_value_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(
        value: &Option<serde_json::Value>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: Option<String> = value.as_ref().map(ToString::to_string);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|text| serde_json::from_str(&text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Logical column data types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int,
    BigInt,
    Float,
    Uuid,
    Varchar,
    Text,
    Boolean,
    Enum,
    Timestamp,
    Json,
}

impl DataType {
    /// Whether values of this type are stored as JSON numbers
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::BigInt | Self::Float | Self::Timestamp)
    }
}

/// Relation cardinalities
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl RelationKind {
    /// The structural inverse of this kind
    #[must_use]
    pub const fn inverse(&self) -> Self {
        match self {
            Self::OneToOne => Self::OneToOne,
            Self::OneToMany => Self::ManyToOne,
            Self::ManyToOne => Self::OneToMany,
            Self::ManyToMany => Self::ManyToMany,
        }
    }

    /// Whether the property resolves to a collection of records
    #[must_use]
    pub const fn is_to_many(&self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }

    /// Whether the foreign key lives on the source table
    #[must_use]
    pub const fn holds_foreign_key(&self) -> bool {
        matches!(self, Self::ManyToOne | Self::OneToOne)
    }
}

/// Derived junction naming for a many-to-many relation
///
/// Persisted on the relation row so both directions agree on identical
/// names; the synthesized inverse mirrors the declared side with the two
/// columns swapped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JunctionNames {
    pub table: String,
    pub source_column: String,
    pub target_column: String,
}

impl JunctionNames {
    /// Derive junction names for the declared side of a many-to-many
    #[must_use]
    pub fn derive(source_table: &str, property_name: &str, target_table: &str) -> Self {
        Self {
            table: naming::junction_table_name(source_table, property_name, target_table),
            source_column: naming::junction_column(source_table, target_table, true),
            target_column: naming::junction_column(source_table, target_table, false),
        }
    }

    /// The same junction viewed from the other direction
    #[must_use]
    pub fn mirrored(&self) -> Self {
        Self {
            table: self.table.clone(),
            source_column: self.target_column.clone(),
            target_column: self.source_column.clone(),
        }
    }
}

/// A table definition row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub id: TableId,
    pub name: String,
    pub alias: Option<String>,
    pub description: Option<String>,
    pub is_system: bool,
    /// Column-name groups that must be unique together
    pub uniques: Vec<Vec<String>>,
    /// Column-name groups to index
    pub indexes: Vec<Vec<String>>,
    /// Owned column ids, embedded by the document backend only
    #[serde(default)]
    pub column_ids: Vec<ColumnId>,
    /// Owned relation ids, embedded by the document backend only
    #[serde(default)]
    pub relation_ids: Vec<RelationId>,
}

impl TableDefinition {
    /// Create a bare table definition with a fresh id
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TableId::new(),
            name: name.into(),
            alias: None,
            description: None,
            is_system: false,
            uniques: Vec::new(),
            indexes: Vec::new(),
            column_ids: Vec::new(),
            relation_ids: Vec::new(),
        }
    }

    /// Whether the table-level fields differ from `other`, ignoring id
    /// and the embedded ownership arrays
    #[must_use]
    pub fn fields_differ(&self, other: &Self) -> bool {
        self.alias != other.alias
            || self.description != other.description
            || self.is_system != other.is_system
            || self.uniques != other.uniques
            || self.indexes != other.indexes
    }
}

/// A column definition row. Unique per `(table_id, name)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub id: ColumnId,
    pub table_id: TableId,
    pub name: String,
    pub data_type: DataType,
    pub is_primary: bool,
    pub is_generated: bool,
    pub is_nullable: bool,
    pub is_system: bool,
    pub is_updatable: bool,
    pub is_hidden: bool,
    #[serde(with = "json_value_option")]
    pub default_value: Option<serde_json::Value>,
    /// Extra type options, e.g. the enum value list
    pub options: Option<Vec<String>>,
    pub description: Option<String>,
}

impl ColumnDefinition {
    /// Create a column with the common flag defaults
    pub fn new(table_id: TableId, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: ColumnId::new(),
            table_id,
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

    /// Whether the diffable fields differ from `other`, ignoring identity
    #[must_use]
    pub fn fields_differ(&self, other: &Self) -> bool {
        self.data_type != other.data_type
            || self.is_nullable != other.is_nullable
            || self.is_primary != other.is_primary
            || self.is_generated != other.is_generated
            || self.default_value != other.default_value
            || self.options != other.options
            || self.is_updatable != other.is_updatable
    }
}

/// A relation definition row. Unique per `(source_table_id, property_name)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub id: RelationId,
    pub source_table_id: TableId,
    pub property_name: String,
    pub kind: RelationKind,
    pub target_table_id: TableId,
    pub inverse_property_name: Option<String>,
    pub is_nullable: bool,
    pub is_system: bool,
    /// True for inverses synthesized by the engine rather than declared
    pub is_generated: bool,
    /// Foreign-key column on the source table (many-to-one / one-to-one)
    pub foreign_key_column: Option<String>,
    /// Junction naming (many-to-many)
    pub junction: Option<JunctionNames>,
}

impl RelationDefinition {
    /// Whether the diffable fields differ from `other`, ignoring identity
    #[must_use]
    pub fn fields_differ(&self, other: &Self) -> bool {
        self.kind != other.kind
            || self.target_table_id != other.target_table_id
            || self.inverse_property_name != other.inverse_property_name
            || self.is_nullable != other.is_nullable
            || self.foreign_key_column != other.foreign_key_column
            || self.junction != other.junction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_kind_inverse() {
        assert_eq!(RelationKind::ManyToOne.inverse(), RelationKind::OneToMany);
        assert_eq!(RelationKind::OneToMany.inverse(), RelationKind::ManyToOne);
        assert_eq!(RelationKind::OneToOne.inverse(), RelationKind::OneToOne);
        assert_eq!(RelationKind::ManyToMany.inverse(), RelationKind::ManyToMany);
    }

    #[test]
    fn test_junction_mirror_shares_table() {
        let declared = JunctionNames::derive("post", "tags", "tag");
        let inverse = declared.mirrored();
        assert_eq!(declared.table, inverse.table);
        assert_eq!(declared.source_column, inverse.target_column);
        assert_eq!(declared.target_column, inverse.source_column);
    }

    #[test]
    fn test_table_fields_differ_ignores_ownership_arrays() {
        let mut a = TableDefinition::new("user");
        let mut b = a.clone();
        b.column_ids.push(fabrica_common::ColumnId::new());
        assert!(!a.fields_differ(&b));
        a.alias = Some("users".into());
        assert!(a.fields_differ(&b));
    }

    #[test]
    fn test_column_fields_differ() {
        let table = TableId::new();
        let a = ColumnDefinition::new(table, "age", DataType::Int);
        let mut b = a.clone();
        assert!(!a.fields_differ(&b));
        b.is_nullable = false;
        assert!(a.fields_differ(&b));
    }

    #[test]
    fn test_definition_bincode_roundtrip() {
        let table = TableDefinition::new("user");
        let mut column = ColumnDefinition::new(table.id, "status", DataType::Enum);
        column.default_value = Some(serde_json::json!("active"));
        column.options = Some(vec!["active".into(), "blocked".into()]);
        let bytes = bincode::serialize(&column).unwrap();
        let decoded: ColumnDefinition = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, column);

        let bytes = bincode::serialize(&table).unwrap();
        let decoded: TableDefinition = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, table);
    }
}
