//! Snapshot-versus-store differ
//!
//! Produces the minimal change set that makes the metadata store match
//! the expanded snapshot, phase-ordered: tables, then columns, then
//! relations with their materialized key columns and junction tables.
//! Isolable problems (missing targets, key collisions) become skipped
//! entries; they never abort the rest of the diff.

use crate::expand::ExpandedRelation;
use crate::report::SkippedEntry;
use crate::snapshot::{ColumnSpec, SchemaSnapshot};
use fabrica_common::TableId;
use fabrica_store::{
    ColumnChange, ColumnDefinition, DataType, RelationChange, RelationDefinition, SchemaChangeSet,
    StoredDefinitions, TableChange, TableDefinition,
};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Differ output: the change set plus everything phase 4 and the report
/// need to know
#[derive(Debug, Default)]
pub struct SchemaDiff {
    pub changes: SchemaChangeSet,
    pub skipped: Vec<SkippedEntry>,
    /// Enum columns whose physical value set needs syncing, with their
    /// table names
    pub enum_syncs: Vec<(String, ColumnDefinition)>,
}

/// Diff an expanded snapshot against the stored definitions.
#[must_use]
pub fn diff_snapshot(
    snapshot: &SchemaSnapshot,
    expanded: &[ExpandedRelation],
    existing: &StoredDefinitions,
) -> SchemaDiff {
    let mut diff = SchemaDiff::default();
    let mut table_ids: HashMap<String, TableId> = existing
        .tables
        .iter()
        .map(|t| (t.name.clone(), t.id))
        .collect();

    diff_tables(snapshot, existing, &mut table_ids, &mut diff);
    diff_columns(snapshot, existing, &table_ids, &mut diff);
    diff_relations(snapshot, expanded, existing, &table_ids, &mut diff);
    diff
}

// ---- Phase 1: tables ----

fn diff_tables(
    snapshot: &SchemaSnapshot,
    existing: &StoredDefinitions,
    table_ids: &mut HashMap<String, TableId>,
    diff: &mut SchemaDiff,
) {
    for spec in snapshot.tables() {
        match existing.table_by_name(&spec.name) {
            None => {
                let mut table = TableDefinition::new(&spec.name);
                table.alias = spec.alias.clone();
                table.description = spec.description.clone();
                table.is_system = spec.is_system;
                table.uniques = spec.uniques.clone();
                table.indexes = spec.indexes.clone();
                table_ids.insert(spec.name.clone(), table.id);
                diff.changes.create_tables.push(TableChange { table });
            }
            Some(stored) => {
                let mut desired = stored.clone();
                desired.alias = spec.alias.clone();
                desired.description = spec.description.clone();
                desired.is_system = spec.is_system;
                desired.uniques = spec.uniques.clone();
                desired.indexes = spec.indexes.clone();
                if stored.fields_differ(&desired) {
                    diff.changes.update_tables.push(TableChange { table: desired });
                }
            }
        }
    }
}

// ---- Phase 2: columns ----

fn diff_columns(
    snapshot: &SchemaSnapshot,
    existing: &StoredDefinitions,
    table_ids: &HashMap<String, TableId>,
    diff: &mut SchemaDiff,
) {
    for spec in snapshot.tables() {
        let Some(&table_id) = table_ids.get(&spec.name) else {
            continue;
        };
        let stored: Vec<&ColumnDefinition> = existing
            .columns
            .iter()
            .filter(|c| c.table_id == table_id)
            .collect();

        for column_spec in &spec.columns {
            match stored.iter().find(|c| c.name == column_spec.name) {
                None => {
                    let column = column_from_spec(table_id, column_spec);
                    push_enum_sync(&spec.name, &column, diff);
                    diff.changes.create_columns.push(ColumnChange {
                        column,
                        table_name: spec.name.clone(),
                    });
                }
                Some(stored_column) => {
                    let mut desired = (*stored_column).clone();
                    apply_column_spec(&mut desired, column_spec);
                    if stored_column.fields_differ(&desired) {
                        push_enum_sync(&spec.name, &desired, diff);
                        diff.changes.update_columns.push(ColumnChange {
                            column: desired,
                            table_name: spec.name.clone(),
                        });
                    }
                }
            }
        }

        // Column retirement: stored, non-system, absent from the spec.
        for stored_column in stored {
            let declared = spec.columns.iter().any(|c| c.name == stored_column.name);
            if !declared && !stored_column.is_system {
                diff.changes.delete_columns.push(ColumnChange {
                    column: stored_column.clone(),
                    table_name: spec.name.clone(),
                });
            }
        }
    }
}

fn column_from_spec(table_id: TableId, spec: &ColumnSpec) -> ColumnDefinition {
    let mut column = ColumnDefinition::new(table_id, &spec.name, spec.data_type);
    apply_column_spec(&mut column, spec);
    column
}

fn apply_column_spec(column: &mut ColumnDefinition, spec: &ColumnSpec) {
    column.data_type = spec.data_type;
    column.is_primary = spec.is_primary;
    column.is_generated = spec.is_generated;
    column.is_nullable = spec.is_nullable;
    column.is_system = spec.is_system;
    column.is_updatable = spec.is_updatable;
    column.is_hidden = spec.is_hidden;
    column.default_value = spec.default_value.clone();
    column.options = spec.options.clone();
    column.description = spec.description.clone();
}

fn push_enum_sync(table_name: &str, column: &ColumnDefinition, diff: &mut SchemaDiff) {
    if column.data_type == DataType::Enum && column.options.is_some() {
        diff.enum_syncs.push((table_name.to_string(), column.clone()));
    }
}

// ---- Phase 3: relations ----

fn diff_relations(
    snapshot: &SchemaSnapshot,
    expanded: &[ExpandedRelation],
    existing: &StoredDefinitions,
    table_ids: &HashMap<String, TableId>,
    diff: &mut SchemaDiff,
) {
    let mut queued_columns: HashSet<(String, String)> = HashSet::new();
    let mut queued_junctions: HashSet<String> = HashSet::new();
    let mut kept: Vec<(TableId, String)> = Vec::new();

    for relation in expanded {
        let Some(&source_id) = table_ids.get(&relation.source_table) else {
            warn!(
                table = %relation.source_table,
                property = %relation.property_name,
                "relation source table not found, skipping"
            );
            diff.skipped.push(SkippedEntry {
                table: relation.source_table.clone(),
                relation: Some(relation.property_name.clone()),
                reason: format!("source table '{}' not found", relation.source_table),
            });
            continue;
        };
        let Some(&target_id) = table_ids.get(&relation.target_table) else {
            warn!(
                table = %relation.source_table,
                property = %relation.property_name,
                target = %relation.target_table,
                "relation target table not found, skipping"
            );
            diff.skipped.push(SkippedEntry {
                table: relation.source_table.clone(),
                relation: Some(relation.property_name.clone()),
                reason: format!("target table '{}' not found", relation.target_table),
            });
            continue;
        };

        // The physical key column lives on the many side and references
        // the one side's primary key.
        if let Some(fk) = &relation.foreign_key_column {
            let (holder, referenced) = if relation.kind.holds_foreign_key() {
                (relation.source_table.clone(), relation.target_table.as_str())
            } else {
                (relation.target_table.clone(), relation.source_table.as_str())
            };
            if fk_collides(snapshot, existing, table_ids, &holder, fk) {
                warn!(
                    table = %relation.source_table,
                    property = %relation.property_name,
                    column = %fk,
                    "foreign-key column collides with a declared column, skipping"
                );
                diff.skipped.push(SkippedEntry {
                    table: relation.source_table.clone(),
                    relation: Some(relation.property_name.clone()),
                    reason: format!("foreign-key column '{fk}' collides with an existing column on '{holder}'"),
                });
                continue;
            }
            materialize_key_column(
                existing,
                table_ids,
                &holder,
                fk,
                key_column_type(snapshot, existing, table_ids, referenced),
                &mut queued_columns,
                diff,
            );
        }

        // Many-to-many pairs live in a system junction table.
        if relation.junction.is_some() {
            materialize_junction(
                snapshot,
                existing,
                table_ids,
                relation,
                &mut queued_junctions,
                &mut queued_columns,
                diff,
            );
        }

        kept.push((source_id, relation.property_name.clone()));

        let stored = existing
            .relations
            .iter()
            .find(|r| r.source_table_id == source_id && r.property_name == relation.property_name);
        match stored {
            None => {
                let definition = RelationDefinition {
                    id: fabrica_common::RelationId::new(),
                    source_table_id: source_id,
                    property_name: relation.property_name.clone(),
                    kind: relation.kind,
                    target_table_id: target_id,
                    inverse_property_name: relation.inverse_property_name.clone(),
                    is_nullable: relation.is_nullable,
                    is_system: false,
                    is_generated: relation.is_generated,
                    foreign_key_column: relation.foreign_key_column.clone(),
                    junction: relation.junction.clone(),
                };
                diff.changes.create_relations.push(RelationChange {
                    relation: definition,
                    source_table_name: relation.source_table.clone(),
                });
            }
            Some(stored) => {
                let mut desired = stored.clone();
                desired.kind = relation.kind;
                desired.target_table_id = target_id;
                desired.inverse_property_name = relation.inverse_property_name.clone();
                desired.is_nullable = relation.is_nullable;
                desired.is_generated = relation.is_generated;
                desired.foreign_key_column = relation.foreign_key_column.clone();
                desired.junction = relation.junction.clone();
                if stored.fields_differ(&desired) || stored.is_generated != desired.is_generated {
                    diff.changes.update_relations.push(RelationChange {
                        relation: desired,
                        source_table_name: relation.source_table.clone(),
                    });
                }
            }
        }
    }

    retire_relations(snapshot, expanded, existing, table_ids, &kept, diff);
}

fn fk_collides(
    snapshot: &SchemaSnapshot,
    existing: &StoredDefinitions,
    table_ids: &HashMap<String, TableId>,
    holder_table: &str,
    fk: &str,
) -> bool {
    if snapshot
        .get(holder_table)
        .is_some_and(|t| t.columns.iter().any(|c| c.name == fk))
    {
        return true;
    }
    let Some(&holder_id) = table_ids.get(holder_table) else {
        return false;
    };
    existing
        .columns
        .iter()
        .any(|c| c.table_id == holder_id && c.name == fk && !c.is_system)
}

/// Primary-key data type of a table, defaulting to Int
fn key_column_type(
    snapshot: &SchemaSnapshot,
    existing: &StoredDefinitions,
    table_ids: &HashMap<String, TableId>,
    table: &str,
) -> DataType {
    if let Some(spec) = snapshot.get(table) {
        if let Some(pk) = spec.columns.iter().find(|c| c.is_primary) {
            return pk.data_type;
        }
    }
    if let Some(&id) = table_ids.get(table) {
        if let Some(pk) = existing
            .columns
            .iter()
            .find(|c| c.table_id == id && c.is_primary)
        {
            return pk.data_type;
        }
    }
    DataType::Int
}

fn materialize_key_column(
    existing: &StoredDefinitions,
    table_ids: &HashMap<String, TableId>,
    holder_table: &str,
    fk: &str,
    data_type: DataType,
    queued: &mut HashSet<(String, String)>,
    diff: &mut SchemaDiff,
) {
    if !queued.insert((holder_table.to_string(), fk.to_string())) {
        return;
    }
    let Some(&holder_id) = table_ids.get(holder_table) else {
        return;
    };
    let already_stored = existing
        .columns
        .iter()
        .any(|c| c.table_id == holder_id && c.name == fk);
    if already_stored {
        return;
    }
    let mut column = ColumnDefinition::new(holder_id, fk, data_type);
    column.is_system = true;
    diff.changes.create_columns.push(ColumnChange {
        column,
        table_name: holder_table.to_string(),
    });
}

fn materialize_junction(
    snapshot: &SchemaSnapshot,
    existing: &StoredDefinitions,
    table_ids: &HashMap<String, TableId>,
    relation: &ExpandedRelation,
    queued_junctions: &mut HashSet<String>,
    queued_columns: &mut HashSet<(String, String)>,
    diff: &mut SchemaDiff,
) {
    let Some(junction) = &relation.junction else {
        return;
    };
    if !queued_junctions.insert(junction.table.clone()) {
        return;
    }
    if existing.table_by_name(&junction.table).is_some() {
        return;
    }

    let mut table = TableDefinition::new(&junction.table);
    table.is_system = true;
    table.uniques = vec![vec![
        junction.source_column.clone(),
        junction.target_column.clone(),
    ]];
    let junction_id = table.id;
    diff.changes.create_tables.push(TableChange { table });

    let source_type = key_column_type(snapshot, existing, table_ids, &relation.source_table);
    let target_type = key_column_type(snapshot, existing, table_ids, &relation.target_table);
    for (name, data_type) in [
        (&junction.source_column, source_type),
        (&junction.target_column, target_type),
    ] {
        if !queued_columns.insert((junction.table.clone(), name.clone())) {
            continue;
        }
        let mut column = ColumnDefinition::new(junction_id, name, data_type);
        column.is_system = true;
        diff.changes.create_columns.push(ColumnChange {
            column,
            table_name: junction.table.clone(),
        });
    }
}

/// Delete stored relations of reconciled tables that the expanded
/// snapshot no longer carries, cascading to their key columns and
/// junction tables when nothing else uses them.
fn retire_relations(
    snapshot: &SchemaSnapshot,
    expanded: &[ExpandedRelation],
    existing: &StoredDefinitions,
    table_ids: &HashMap<String, TableId>,
    kept: &[(TableId, String)],
    diff: &mut SchemaDiff,
) {
    let names_by_id: HashMap<TableId, &str> = existing
        .tables
        .iter()
        .map(|t| (t.id, t.name.as_str()))
        .collect();

    for stored in &existing.relations {
        let Some(source_name) = names_by_id.get(&stored.source_table_id) else {
            continue;
        };
        // Only relations of tables present in the snapshot are reconciled.
        if snapshot.get(source_name).is_none() || stored.is_system {
            continue;
        }
        let still_wanted = kept
            .iter()
            .any(|(id, prop)| *id == stored.source_table_id && prop == &stored.property_name);
        if still_wanted {
            continue;
        }

        diff.changes.delete_relations.push(RelationChange {
            relation: stored.clone(),
            source_table_name: (*source_name).to_string(),
        });

        // Key column cleanup, unless another surviving relation uses it.
        if let Some(fk) = &stored.foreign_key_column {
            let holder = if stored.kind.holds_foreign_key() {
                (*source_name).to_string()
            } else {
                names_by_id
                    .get(&stored.target_table_id)
                    .map_or_else(String::new, |n| (*n).to_string())
            };
            let still_used = expanded.iter().any(|r| {
                r.foreign_key_column.as_deref() == Some(fk)
                    && (r.source_table == holder || r.target_table == holder)
            });
            if !still_used {
                if let Some(&holder_id) = table_ids.get(&holder) {
                    if let Some(column) = existing
                        .columns
                        .iter()
                        .find(|c| c.table_id == holder_id && c.name == *fk && c.is_system)
                    {
                        diff.changes.delete_columns.push(ColumnChange {
                            column: column.clone(),
                            table_name: holder,
                        });
                    }
                }
            }
        }

        // Junction cleanup once no surviving relation references it.
        if let Some(junction) = &stored.junction {
            let still_used = expanded
                .iter()
                .any(|r| r.junction.as_ref().is_some_and(|j| j.table == junction.table));
            let queued = diff
                .changes
                .delete_tables
                .iter()
                .any(|t| t.table.name == junction.table);
            if !still_used && !queued {
                if let Some(table) = existing.table_by_name(&junction.table) {
                    for column in existing.columns.iter().filter(|c| c.table_id == table.id) {
                        diff.changes.delete_columns.push(ColumnChange {
                            column: column.clone(),
                            table_name: table.name.clone(),
                        });
                    }
                    diff.changes.delete_tables.push(TableChange {
                        table: table.clone(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expand::expand_relations;
    use crate::snapshot::{ColumnSpec, RelationSpec, TableSpec};
    use fabrica_store::RelationKind;

    fn blog_snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new()
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
                TableSpec::new("user")
                    .with_column(ColumnSpec::primary("id", DataType::Int))
                    .with_column(ColumnSpec::new("name", DataType::Varchar)),
            )
    }

    fn diff_fresh(snapshot: &SchemaSnapshot) -> SchemaDiff {
        let expanded = expand_relations(snapshot);
        diff_snapshot(snapshot, &expanded, &StoredDefinitions::default())
    }

    #[test]
    fn test_fresh_diff_creates_everything() {
        let diff = diff_fresh(&blog_snapshot());
        assert_eq!(diff.changes.create_tables.len(), 2);
        // Declared columns plus the materialized author_id key column
        assert_eq!(diff.changes.create_columns.len(), 5);
        assert!(
            diff.changes
                .create_columns
                .iter()
                .any(|c| c.column.name == "author_id" && c.column.is_system)
        );
        // Declared relation plus the derived inverse
        assert_eq!(diff.changes.create_relations.len(), 2);
        assert!(diff.skipped.is_empty());
    }

    #[test]
    fn test_missing_target_is_skipped_not_fatal() {
        let snapshot = SchemaSnapshot::new().with_table(
            TableSpec::new("post")
                .with_column(ColumnSpec::primary("id", DataType::Int))
                .with_relation(RelationSpec::new("author", RelationKind::ManyToOne, "user")),
        );
        let diff = diff_fresh(&snapshot);
        assert_eq!(diff.changes.create_tables.len(), 1);
        assert!(diff.changes.create_relations.is_empty());
        assert_eq!(diff.skipped.len(), 1);
        assert!(diff.skipped[0].reason.contains("user"));
    }

    #[test]
    fn test_fk_collision_is_skipped() {
        let snapshot = SchemaSnapshot::new()
            .with_table(
                TableSpec::new("post")
                    .with_column(ColumnSpec::primary("id", DataType::Int))
                    // A plain column already claims the derived key name.
                    .with_column(ColumnSpec::new("author_id", DataType::Varchar))
                    .with_relation(RelationSpec::new("author", RelationKind::ManyToOne, "user")),
            )
            .with_table(TableSpec::new("user").with_column(ColumnSpec::primary("id", DataType::Int)));
        let diff = diff_fresh(&snapshot);
        assert!(diff.changes.create_relations.is_empty());
        assert_eq!(diff.skipped.len(), 1);
        assert!(diff.skipped[0].reason.contains("author_id"));
    }

    #[test]
    fn test_junction_materialized_once() {
        let snapshot = SchemaSnapshot::new()
            .with_table(
                TableSpec::new("post")
                    .with_column(ColumnSpec::primary("id", DataType::Int))
                    .with_relation(
                        RelationSpec::new("tags", RelationKind::ManyToMany, "tag")
                            .with_inverse("posts"),
                    ),
            )
            .with_table(TableSpec::new("tag").with_column(ColumnSpec::primary("id", DataType::Int)));
        let diff = diff_fresh(&snapshot);
        let junctions: Vec<_> = diff
            .changes
            .create_tables
            .iter()
            .filter(|t| t.table.is_system)
            .collect();
        assert_eq!(junctions.len(), 1);
        assert_eq!(junctions[0].table.name, "post_tag_tags");
        assert_eq!(
            junctions[0].table.uniques,
            vec![vec!["post_id".to_string(), "tag_id".to_string()]]
        );
        // Both junction key columns materialized exactly once.
        let junction_columns: Vec<_> = diff
            .changes
            .create_columns
            .iter()
            .filter(|c| c.table_name == "post_tag_tags")
            .collect();
        assert_eq!(junction_columns.len(), 2);
    }

    #[test]
    fn test_enum_columns_queued_for_sync() {
        let snapshot = SchemaSnapshot::new().with_table(
            TableSpec::new("user")
                .with_column(ColumnSpec::primary("id", DataType::Int))
                .with_column(
                    ColumnSpec::new("status", DataType::Enum)
                        .with_options(vec!["active".into(), "blocked".into()]),
                ),
        );
        let diff = diff_fresh(&snapshot);
        assert_eq!(diff.enum_syncs.len(), 1);
        assert_eq!(diff.enum_syncs[0].0, "user");
        assert_eq!(diff.enum_syncs[0].1.name, "status");
    }
}
