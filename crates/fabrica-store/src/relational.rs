//! Relational storage engine backed by redb
//!
//! Definition rows and data rows live in one redb database. A schema
//! change set is applied inside a single write transaction, so any
//! failure rolls the whole reconciliation back. Joins are executed as
//! nested lookups over the normalized row tables; many-to-many pairs are
//! stored in dedicated junction tables.

use crate::adapter::{StorageAdapter, StoredDefinitions};
use crate::change::{AppliedCounts, SchemaChangeSet};
use crate::definitions::{ColumnDefinition, JunctionNames, RelationDefinition, TableDefinition};
use crate::plan::{
    FilterNode, JoinStep, PkGeneration, Record, SelectPlan, WriteTarget, sort_records, value_key,
};
use crate::tables;
use async_trait::async_trait;
use fabrica_common::{BackendKind, Error, Result, StoreConfig, epoch_millis};
use redb::{Database, ReadableTable, TableDefinition as RedbTable, TableError};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn store_err(e: impl std::fmt::Display) -> Error {
    Error::storage(e.to_string())
}

fn txn_err(e: impl std::fmt::Display) -> Error {
    Error::ReconcileTransactionFailed(e.to_string())
}

/// Relational engine over a single redb database
pub struct RelationalStore {
    db: Database,
}

impl RelationalStore {
    /// Open (or create) the database, retrying a bounded number of times
    /// before giving up with `ConnectionUnavailable`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let mut attempt = 0u32;
        let db = loop {
            attempt += 1;
            match Self::try_open(&config.data_path) {
                Ok(db) => break db,
                Err(e) if attempt < config.connect_attempts => {
                    warn!(attempt, error = %e, "store open failed, retrying");
                    tokio::time::sleep(config.connect_retry_delay).await;
                }
                Err(e) => {
                    error!(attempts = attempt, error = %e, "store unavailable");
                    return Err(Error::ConnectionUnavailable {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        };
        let store = Self { db };
        store.ensure_metadata_tables()?;
        info!(path = %config.data_path.display(), "relational store opened");
        Ok(store)
    }

    fn try_open(path: &Path) -> std::result::Result<Database, redb::DatabaseError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Database::create(path)
    }

    // Create the metadata tables eagerly so later read txns don't fail.
    fn ensure_metadata_tables(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let _t = txn.open_table(tables::TABLE_DEFS).map_err(store_err)?;
            let _t = txn.open_table(tables::COLUMN_DEFS).map_err(store_err)?;
            let _t = txn.open_table(tables::RELATION_DEFS).map_err(store_err)?;
            let _t = txn.open_table(tables::PHYSICAL_ENUMS).map_err(store_err)?;
            let _t = txn.open_table(tables::SEQUENCES).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)
    }

    /// Scan all rows of a data collection; a collection that was never
    /// written reads as empty.
    fn scan(&self, table_name: &str) -> Result<Vec<Record>> {
        let name = tables::data_table_name(table_name);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(store_err(e)),
        };
        let mut records = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (key, bytes) = entry.map_err(store_err)?;
            match serde_json::from_slice::<Record>(bytes.value()) {
                Ok(record) => records.push(record),
                Err(e) => error!(table = table_name, key = key.value(), "bad row: {e}"),
            }
        }
        Ok(records)
    }

    fn fetch_by_pk(&self, table_name: &str, pk: &Value) -> Result<Option<Record>> {
        let name = tables::data_table_name(table_name);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(store_err(e)),
        };
        let key = value_key(pk);
        match table.get(key.as_str()).map_err(store_err)? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(bytes.value()).map_err(store_err)?,
            )),
            None => Ok(None),
        }
    }

    fn apply_join(&self, records: &mut Vec<Record>, step: &JoinStep) -> Result<()> {
        let (property, parent_path) = step
            .path
            .split_last()
            .ok_or_else(|| Error::internal("empty join path"))?;
        // Resolve each parent record independently; multi-level paths see
        // the records attached by earlier (shallower) steps.
        let rel = &step.relation;
        let mut attach = |parent: &mut Record| -> Result<()> {
            let value = if let Some(junction) = &rel.junction {
                let owner = parent.get(&rel.source_pk).cloned().unwrap_or(Value::Null);
                let targets = self.junction_targets_sync(junction, &owner)?;
                let mut related = Vec::new();
                for target_key in targets {
                    if let Some(row) = self.fetch_by_pk(&rel.target_table, &target_key)? {
                        related.push(Value::Object(row));
                    }
                }
                Value::Array(related)
            } else if rel.foreign_key_on_target {
                let fk = rel
                    .foreign_key
                    .as_deref()
                    .ok_or_else(|| Error::internal("join step without foreign key"))?;
                let owner = parent.get(&rel.source_pk).cloned().unwrap_or(Value::Null);
                let mut related: Vec<Value> = self
                    .scan(&rel.target_table)?
                    .into_iter()
                    .filter(|row| {
                        row.get(fk)
                            .is_some_and(|v| crate::plan::values_equal(v, &owner))
                    })
                    .map(Value::Object)
                    .collect();
                if rel.kind.is_to_many() {
                    Value::Array(related)
                } else {
                    // Synthesized to-one inverse: unwind to a single record
                    related.pop().unwrap_or(Value::Null)
                }
            } else {
                let fk = rel
                    .foreign_key
                    .as_deref()
                    .ok_or_else(|| Error::internal("join step without foreign key"))?;
                match parent.get(fk) {
                    None | Some(Value::Null) => Value::Null,
                    Some(key) => self
                        .fetch_by_pk(&rel.target_table, key)?
                        .map_or(Value::Null, Value::Object),
                }
            };
            parent.insert(property.clone(), value);
            Ok(())
        };
        for record in records.iter_mut() {
            visit_at_path(record, parent_path, &mut attach)?;
        }
        Ok(())
    }

    fn junction_targets_sync(&self, junction: &JunctionNames, owner: &Value) -> Result<Vec<Value>> {
        let rows = self.scan(&junction.table)?;
        Ok(rows
            .into_iter()
            .filter(|row| {
                row.get(&junction.source_column)
                    .is_some_and(|v| crate::plan::values_equal(v, owner))
            })
            .filter_map(|row| row.get(&junction.target_column).cloned())
            .collect())
    }

    fn next_sequence(&self, table_name: &str) -> Result<u64> {
        let txn = self.db.begin_write().map_err(store_err)?;
        let next = {
            let mut seq = txn.open_table(tables::SEQUENCES).map_err(store_err)?;
            let current = seq
                .get(table_name)
                .map_err(store_err)?
                .map_or(0, |v| v.value());
            let next = current + 1;
            seq.insert(table_name, next).map_err(store_err)?;
            next
        };
        txn.commit().map_err(store_err)?;
        Ok(next)
    }

    fn write_row(&self, table_name: &str, key: &str, row: &Record) -> Result<()> {
        let name = tables::data_table_name(table_name);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let bytes = serde_json::to_vec(row).map_err(store_err)?;
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(def).map_err(store_err)?;
            table.insert(key, bytes.as_slice()).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)
    }
}

/// Walk `path` through a record, calling `f` on every record found at the
/// end of the path (to-many hops fan out over array elements).
fn visit_at_path(
    record: &mut Record,
    path: &[String],
    f: &mut impl FnMut(&mut Record) -> Result<()>,
) -> Result<()> {
    let Some((head, rest)) = path.split_first() else {
        return f(record);
    };
    if matches!(record.get(head), Some(Value::Object(_))) {
        // Detach the nested object so the recursion can borrow it.
        let Some(Value::Object(mut taken)) = record.remove(head) else {
            return Ok(());
        };
        let result = visit_at_path(&mut taken, rest, f);
        record.insert(head.clone(), Value::Object(taken));
        return result;
    }
    if let Some(Value::Array(items)) = record.get_mut(head) {
        for item in items {
            if let Value::Object(map) = item {
                visit_at_path(map, rest, f)?;
            }
        }
    }
    Ok(())
}

/// Prune fetched records down to the requested projection
fn project(records: &mut [Record], plan: &SelectPlan) {
    prune_level(records, &[], &plan.base_fields, &plan.joins);
}

fn prune_level(records: &mut [Record], prefix: &[String], fields: &[String], joins: &[JoinStep]) {
    // Child properties attached one level below this prefix
    let children: Vec<&JoinStep> = joins
        .iter()
        .filter(|s| s.path.len() == prefix.len() + 1 && s.path.starts_with(prefix))
        .collect();
    for record in records.iter_mut() {
        if !fields.is_empty() {
            let keep: Vec<String> = fields
                .iter()
                .cloned()
                .chain(children.iter().filter_map(|s| s.path.last().cloned()))
                .collect();
            record.retain(|k, _| keep.iter().any(|f| f == k));
        }
    }
    for step in children {
        let property = step.path.last().expect("join path is never empty");
        for record in records.iter_mut() {
            match record.get_mut(property) {
                Some(Value::Object(map)) => {
                    let mut nested = vec![std::mem::take(map)];
                    prune_level(&mut nested, &step.path, &step.fields, joins);
                    *map = nested.pop().unwrap_or_default();
                }
                Some(Value::Array(items)) => {
                    let mut nested: Vec<Record> = items
                        .iter_mut()
                        .filter_map(|v| v.as_object_mut().map(std::mem::take))
                        .collect();
                    prune_level(&mut nested, &step.path, &step.fields, joins);
                    *items = nested.into_iter().map(Value::Object).collect();
                }
                _ => {}
            }
        }
    }
}

/// Canonical key for one junction pair, independent of direction
fn junction_row_key(junction: &JunctionNames, owner: &Value, target: &Value) -> String {
    let mut pair = [
        (junction.source_column.as_str(), value_key(owner)),
        (junction.target_column.as_str(), value_key(target)),
    ];
    pair.sort_by(|a, b| a.0.cmp(b.0));
    tables::junction_key(&pair[0].1, &pair[1].1)
}

#[async_trait]
impl StorageAdapter for RelationalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn load_definitions(&self) -> Result<StoredDefinitions> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let mut defs = StoredDefinitions::default();

        let table = txn.open_table(tables::TABLE_DEFS).map_err(store_err)?;
        for entry in table.iter().map_err(store_err)? {
            let (key, bytes) = entry.map_err(store_err)?;
            match bincode::deserialize::<TableDefinition>(bytes.value()) {
                Ok(def) => defs.tables.push(def),
                Err(e) => error!(key = key.value(), "bad table definition: {e}"),
            }
        }
        let table = txn.open_table(tables::COLUMN_DEFS).map_err(store_err)?;
        for entry in table.iter().map_err(store_err)? {
            let (key, bytes) = entry.map_err(store_err)?;
            match bincode::deserialize::<ColumnDefinition>(bytes.value()) {
                Ok(def) => defs.columns.push(def),
                Err(e) => error!(key = key.value(), "bad column definition: {e}"),
            }
        }
        let table = txn.open_table(tables::RELATION_DEFS).map_err(store_err)?;
        for entry in table.iter().map_err(store_err)? {
            let (key, bytes) = entry.map_err(store_err)?;
            match bincode::deserialize::<RelationDefinition>(bytes.value()) {
                Ok(def) => defs.relations.push(def),
                Err(e) => error!(key = key.value(), "bad relation definition: {e}"),
            }
        }
        Ok(defs)
    }

    async fn apply_schema(&self, changes: &SchemaChangeSet) -> Result<AppliedCounts> {
        if changes.is_empty() {
            debug!("schema change set empty, nothing to apply");
            return Ok(AppliedCounts::default());
        }
        let txn = self.db.begin_write().map_err(txn_err)?;
        {
            let mut table = txn.open_table(tables::TABLE_DEFS).map_err(txn_err)?;
            for change in changes.create_tables.iter().chain(&changes.update_tables) {
                let bytes = bincode::serialize(&change.table).map_err(txn_err)?;
                table
                    .insert(change.table.id.to_string().as_str(), bytes.as_slice())
                    .map_err(txn_err)?;
            }
            for change in &changes.delete_tables {
                table
                    .remove(change.table.id.to_string().as_str())
                    .map_err(txn_err)?;
            }
        }
        {
            let mut table = txn.open_table(tables::COLUMN_DEFS).map_err(txn_err)?;
            for change in changes.create_columns.iter().chain(&changes.update_columns) {
                let bytes = bincode::serialize(&change.column).map_err(txn_err)?;
                table
                    .insert(change.column.id.to_string().as_str(), bytes.as_slice())
                    .map_err(txn_err)?;
            }
            for change in &changes.delete_columns {
                table
                    .remove(change.column.id.to_string().as_str())
                    .map_err(txn_err)?;
            }
        }
        {
            let mut table = txn.open_table(tables::RELATION_DEFS).map_err(txn_err)?;
            for change in changes
                .create_relations
                .iter()
                .chain(&changes.update_relations)
            {
                let bytes = bincode::serialize(&change.relation).map_err(txn_err)?;
                table
                    .insert(change.relation.id.to_string().as_str(), bytes.as_slice())
                    .map_err(txn_err)?;
            }
            for change in &changes.delete_relations {
                table
                    .remove(change.relation.id.to_string().as_str())
                    .map_err(txn_err)?;
            }
        }

        // Physical collections: create eagerly, drop retired ones.
        for change in &changes.create_tables {
            let name = tables::data_table_name(&change.table.name);
            let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
            let _t = txn.open_table(def).map_err(txn_err)?;
        }
        for change in &changes.delete_tables {
            let name = tables::data_table_name(&change.table.name);
            let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
            match txn.delete_table(def) {
                Ok(_) => {}
                Err(TableError::TableDoesNotExist(_)) => {}
                Err(e) => return Err(txn_err(e)),
            }
        }

        // Column retirement strips the field from stored rows.
        for change in &changes.delete_columns {
            let name = tables::data_table_name(&change.table_name);
            let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
            let mut data = match txn.open_table(def) {
                Ok(data) => data,
                Err(TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(txn_err(e)),
            };
            let mut rewritten: Vec<(String, Vec<u8>)> = Vec::new();
            for entry in data.iter().map_err(txn_err)? {
                let (key, bytes) = entry.map_err(txn_err)?;
                let mut row: Record = serde_json::from_slice(bytes.value()).map_err(txn_err)?;
                if row.remove(&change.column.name).is_some() {
                    rewritten.push((
                        key.value().to_string(),
                        serde_json::to_vec(&row).map_err(txn_err)?,
                    ));
                }
            }
            for (key, bytes) in rewritten {
                data.insert(key.as_str(), bytes.as_slice()).map_err(txn_err)?;
            }
        }

        txn.commit().map_err(txn_err)?;
        let counts = AppliedCounts::from_change_set(changes);
        info!(writes = counts.total(), "schema change set applied");
        Ok(counts)
    }

    async fn sync_enum_options(&self, table_name: &str, column: &ColumnDefinition) -> Result<()> {
        let options = column
            .options
            .as_deref()
            .ok_or_else(|| Error::internal("enum sync on a column without options"))?;
        // The physical value set only narrows if no stored value falls
        // outside it, the analog of a failing ALTER.
        for row in self.scan(table_name)? {
            if let Some(Value::String(value)) = row.get(&column.name) {
                if !options.iter().any(|o| o == value) {
                    return Err(Error::storage(format!(
                        "stored value '{value}' outside enum set for {table_name}.{}",
                        column.name
                    )));
                }
            }
        }
        let key = tables::enum_key(table_name, &column.name);
        let bytes = serde_json::to_vec(options).map_err(store_err)?;
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(tables::PHYSICAL_ENUMS).map_err(store_err)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;
        debug!(table = table_name, column = %column.name, "enum options synced");
        Ok(())
    }

    async fn fetch(&self, plan: &SelectPlan) -> Result<Vec<Record>> {
        let mut records = self.scan(&plan.table)?;
        if let Some(filter) = &plan.filter {
            records.retain(|r| filter.matches(r));
        }
        sort_records(&mut records, &plan.sort);
        // Relation sorts can only run once the joined fields exist, so
        // pagination waits for them too.
        if plan.relation_sort.is_empty() {
            plan.page.apply(&mut records);
        }
        for step in &plan.joins {
            self.apply_join(&mut records, step)?;
        }
        if !plan.relation_sort.is_empty() {
            sort_records(&mut records, &plan.relation_sort);
            plan.page.apply(&mut records);
        }
        project(&mut records, plan);
        Ok(records)
    }

    async fn count(&self, table_name: &str, filter: Option<&FilterNode>) -> Result<u64> {
        let records = self.scan(table_name)?;
        let count = match filter {
            Some(f) => records.iter().filter(|r| f.matches(r)).count(),
            None => records.len(),
        };
        Ok(count as u64)
    }

    async fn insert_row(&self, target: &WriteTarget, mut row: Record) -> Result<Value> {
        let provided = row
            .get(&target.primary_key)
            .cloned()
            .filter(|v| !v.is_null());
        let pk = match (provided, target.generation) {
            (Some(value), _) => value,
            (None, PkGeneration::Uuid) => Value::String(Uuid::new_v4().to_string()),
            (None, PkGeneration::Sequence) => Value::from(self.next_sequence(&target.table)?),
            (None, PkGeneration::Provided) => {
                return Err(Error::invalid_query(format!(
                    "missing primary key '{}' for table '{}'",
                    target.primary_key, target.table
                )));
            }
        };
        let key = value_key(&pk);
        if self.fetch_by_pk(&target.table, &pk)?.is_some() {
            return Err(Error::storage(format!(
                "duplicate primary key '{key}' in table '{}'",
                target.table
            )));
        }
        row.insert(target.primary_key.clone(), pk.clone());
        let now = epoch_millis();
        row.entry("created_at".to_string())
            .or_insert_with(|| Value::from(now));
        row.insert("updated_at".to_string(), Value::from(now));
        self.write_row(&target.table, &key, &row)?;
        Ok(pk)
    }

    async fn update_rows(
        &self,
        target: &WriteTarget,
        filter: &FilterNode,
        mut changes: Record,
    ) -> Result<u64> {
        // The primary key addresses the row; it never moves on update.
        changes.remove(&target.primary_key);
        changes.insert("updated_at".to_string(), Value::from(epoch_millis()));
        let mut affected = 0u64;
        for mut row in self.scan(&target.table)? {
            if !filter.matches(&row) {
                continue;
            }
            let Some(pk) = row.get(&target.primary_key).cloned() else {
                continue;
            };
            for (field, value) in changes.clone() {
                row.insert(field, value);
            }
            self.write_row(&target.table, &value_key(&pk), &row)?;
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete_rows(&self, target: &WriteTarget, filter: &FilterNode) -> Result<u64> {
        let keys: Vec<String> = self
            .scan(&target.table)?
            .into_iter()
            .filter(|row| filter.matches(row))
            .filter_map(|row| row.get(&target.primary_key).map(value_key))
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }
        let name = tables::data_table_name(&target.table);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(def).map_err(store_err)?;
            for key in &keys {
                table.remove(key.as_str()).map_err(store_err)?;
            }
        }
        txn.commit().map_err(store_err)?;
        Ok(keys.len() as u64)
    }

    async fn replace_junction(
        &self,
        junction: &JunctionNames,
        owner: &Value,
        targets: &[Value],
    ) -> Result<()> {
        self.clear_junction(junction, owner).await?;
        let name = tables::data_table_name(&junction.table);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(def).map_err(store_err)?;
            for target in targets {
                let mut row = Record::new();
                row.insert(junction.source_column.clone(), owner.clone());
                row.insert(junction.target_column.clone(), target.clone());
                let key = junction_row_key(junction, owner, target);
                let bytes = serde_json::to_vec(&row).map_err(store_err)?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(store_err)?;
            }
        }
        txn.commit().map_err(store_err)?;
        debug!(
            junction = %junction.table,
            owner = %value_key(owner),
            count = targets.len(),
            "junction rows replaced"
        );
        Ok(())
    }

    async fn clear_junction(&self, junction: &JunctionNames, owner: &Value) -> Result<u64> {
        let rows = self.scan(&junction.table)?;
        let keys: Vec<String> = rows
            .iter()
            .filter(|row| {
                row.get(&junction.source_column)
                    .is_some_and(|v| crate::plan::values_equal(v, owner))
            })
            .filter_map(|row| {
                row.get(&junction.target_column)
                    .map(|t| junction_row_key(junction, owner, t))
            })
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }
        let name = tables::data_table_name(&junction.table);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(def).map_err(store_err)?;
            for key in &keys {
                table.remove(key.as_str()).map_err(store_err)?;
            }
        }
        txn.commit().map_err(store_err)?;
        Ok(keys.len() as u64)
    }

    async fn junction_targets(&self, junction: &JunctionNames, owner: &Value) -> Result<Vec<Value>> {
        self.junction_targets_sync(junction, owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ColumnChange, TableChange};
    use crate::definitions::DataType;
    use fabrica_common::TableId;
    use serde_json::json;

    async fn open_store() -> (tempfile::TempDir, RelationalStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            data_path: dir.path().join("store.redb"),
            ..StoreConfig::default()
        };
        let store = RelationalStore::open(&config).await.unwrap();
        (dir, store)
    }

    fn user_change_set() -> (TableId, SchemaChangeSet) {
        let table = TableDefinition::new("user");
        let table_id = table.id;
        let mut changes = SchemaChangeSet::default();
        changes.create_tables.push(TableChange { table });
        for (name, data_type) in [
            ("id", DataType::Uuid),
            ("name", DataType::Varchar),
            ("email", DataType::Varchar),
        ] {
            changes.create_columns.push(ColumnChange {
                column: ColumnDefinition::new(table_id, name, data_type),
                table_name: "user".into(),
            });
        }
        (table_id, changes)
    }

    fn write_target(table: &str) -> WriteTarget {
        WriteTarget {
            table: table.into(),
            primary_key: "id".into(),
            generation: PkGeneration::Uuid,
        }
    }

    fn bare_plan(table: &str) -> SelectPlan {
        SelectPlan {
            table: table.into(),
            base_fields: Vec::new(),
            joins: Vec::new(),
            filter: None,
            sort: Vec::new(),
            relation_sort: Vec::new(),
            page: crate::plan::Page::default(),
        }
    }

    #[tokio::test]
    async fn test_definitions_roundtrip() {
        let (_dir, store) = open_store().await;
        let (table_id, changes) = user_change_set();
        let counts = store.apply_schema(&changes).await.unwrap();
        assert_eq!(counts.tables_created, 1);
        assert_eq!(counts.columns_created, 3);

        let defs = store.load_definitions().await.unwrap();
        assert_eq!(defs.tables.len(), 1);
        let table = defs.table_by_name("user").unwrap();
        assert_eq!(table.id, table_id);
        assert_eq!(defs.columns_of(table).count(), 3);
    }

    #[tokio::test]
    async fn test_empty_change_set_is_no_write() {
        let (_dir, store) = open_store().await;
        let counts = store.apply_schema(&SchemaChangeSet::default()).await.unwrap();
        assert!(counts.is_zero());
    }

    #[tokio::test]
    async fn test_insert_fetch_filter_sort() {
        let (_dir, store) = open_store().await;
        let (_, changes) = user_change_set();
        store.apply_schema(&changes).await.unwrap();

        let target = write_target("user");
        for (name, age) in [("carol", 31), ("alice", 27), ("bob", 19)] {
            let row: Record = json!({"name": name, "age": age})
                .as_object()
                .unwrap()
                .clone();
            store.insert_row(&target, row).await.unwrap();
        }

        let mut plan = bare_plan("user");
        plan.filter = Some(FilterNode::Cond(crate::plan::FilterCond {
            field: "age".into(),
            op: crate::plan::CompareOp::Gt,
            value: json!(20),
        }));
        plan.sort = vec![crate::plan::SortKey::parse("-age")];
        let rows = store.fetch(&plan).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], json!("carol"));
        assert_eq!(rows[1]["name"], json!("alice"));
        // System columns were injected on insert
        assert!(rows[0].contains_key("created_at"));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (_dir, store) = open_store().await;
        let (_, changes) = user_change_set();
        store.apply_schema(&changes).await.unwrap();

        let target = write_target("user");
        let row: Record = json!({"name": "alice", "status": "active"})
            .as_object()
            .unwrap()
            .clone();
        let pk = store.insert_row(&target, row).await.unwrap();

        let by_pk = FilterNode::eq("id", pk.clone());
        let changes_row: Record = json!({"status": "blocked"}).as_object().unwrap().clone();
        let affected = store
            .update_rows(&target, &by_pk, changes_row)
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = store.fetch(&bare_plan("user")).await.unwrap();
        assert_eq!(rows[0]["status"], json!("blocked"));

        let removed = store.delete_rows(&target, &by_pk).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count("user", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_column_retirement_strips_rows() {
        let (_dir, store) = open_store().await;
        let (table_id, changes) = user_change_set();
        store.apply_schema(&changes).await.unwrap();

        let target = write_target("user");
        let row: Record = json!({"name": "alice", "email": "a@example.com"})
            .as_object()
            .unwrap()
            .clone();
        store.insert_row(&target, row).await.unwrap();

        let email = changes
            .create_columns
            .iter()
            .find(|c| c.column.name == "email")
            .unwrap()
            .clone();
        let mut retire = SchemaChangeSet::default();
        retire.delete_columns.push(email);
        store.apply_schema(&retire).await.unwrap();

        let rows = store.fetch(&bare_plan("user")).await.unwrap();
        assert!(!rows[0].contains_key("email"));
        assert_eq!(rows[0]["name"], json!("alice"));
        let _ = table_id;
    }

    #[tokio::test]
    async fn test_junction_replace_is_exact() {
        let (_dir, store) = open_store().await;
        let junction = JunctionNames::derive("post", "tags", "tag");
        let owner = json!(1);
        store
            .replace_junction(&junction, &owner, &[json!(1), json!(2)])
            .await
            .unwrap();
        store
            .replace_junction(&junction, &owner, &[json!(2), json!(3)])
            .await
            .unwrap();
        let mut targets = store.junction_targets(&junction, &owner).await.unwrap();
        targets.sort_by_key(|v| v.as_i64());
        assert_eq!(targets, vec![json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_enum_sync_rejects_out_of_set_values() {
        let (_dir, store) = open_store().await;
        let (table_id, changes) = user_change_set();
        store.apply_schema(&changes).await.unwrap();

        let target = write_target("user");
        let row: Record = json!({"status": "archived"}).as_object().unwrap().clone();
        store.insert_row(&target, row).await.unwrap();

        let mut status = ColumnDefinition::new(table_id, "status", DataType::Enum);
        status.options = Some(vec!["active".into(), "blocked".into()]);
        let err = store.sync_enum_options("user", &status).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        status.options = Some(vec!["active".into(), "blocked".into(), "archived".into()]);
        store.sync_enum_options("user", &status).await.unwrap();
    }
}
