//! Document storage engine backed by redb
//!
//! Collections hold JSON documents; table documents embed the id arrays
//! of their owned columns and relations. The engine has no multi-step
//! transactions: a schema change set is applied as an ordered sequence
//! of single-document writes with a compensation log, replayed in
//! reverse if a step fails. Relation paths are resolved as lookups, with
//! an unwind for to-one semantics.

use crate::adapter::{StorageAdapter, StoredDefinitions};
use crate::change::{AppliedCounts, SchemaChangeSet};
use crate::definitions::{ColumnDefinition, JunctionNames, RelationDefinition, TableDefinition};
use crate::plan::{
    FilterNode, JoinStep, PkGeneration, Record, SelectPlan, WriteTarget, sort_records, value_key,
    values_equal,
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

/// Which metadata collection a compensation entry targets
#[derive(Clone, Copy, Debug)]
enum MetaCollection {
    Tables,
    Columns,
    Relations,
}

impl MetaCollection {
    const fn def(self) -> RedbTable<'static, &'static str, &'static [u8]> {
        match self {
            Self::Tables => tables::TABLE_DEFS,
            Self::Columns => tables::COLUMN_DEFS,
            Self::Relations => tables::RELATION_DEFS,
        }
    }
}

/// One undo entry of the compensation log
#[derive(Clone, Debug)]
enum Compensation {
    /// Restore a prior document
    Restore {
        collection: MetaCollection,
        key: String,
        bytes: Vec<u8>,
    },
    /// Remove a document this run created
    Remove {
        collection: MetaCollection,
        key: String,
    },
}

/// Document engine over a single redb database
pub struct DocumentStore {
    db: Database,
}

impl DocumentStore {
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
        store.ensure_metadata_collections()?;
        info!(path = %config.data_path.display(), "document store opened");
        Ok(store)
    }

    fn try_open(path: &Path) -> std::result::Result<Database, redb::DatabaseError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Database::create(path)
    }

    fn ensure_metadata_collections(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let _t = txn.open_table(tables::TABLE_DEFS).map_err(store_err)?;
            let _t = txn.open_table(tables::COLUMN_DEFS).map_err(store_err)?;
            let _t = txn.open_table(tables::RELATION_DEFS).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)
    }

    // ---- Single-document steps ----

    /// Write one metadata document in its own transaction, recording the
    /// compensation for a later rollback.
    fn put_meta(
        &self,
        collection: MetaCollection,
        key: &str,
        bytes: &[u8],
        log: &mut Vec<Compensation>,
    ) -> Result<()> {
        let txn = self.db.begin_write().map_err(store_err)?;
        let prior = {
            let mut table = txn.open_table(collection.def()).map_err(store_err)?;
            let prior = table
                .get(key)
                .map_err(store_err)?
                .map(|g| g.value().to_vec());
            table.insert(key, bytes).map_err(store_err)?;
            prior
        };
        txn.commit().map_err(store_err)?;
        log.push(prior.map_or_else(
            || Compensation::Remove {
                collection,
                key: key.to_string(),
            },
            |bytes| Compensation::Restore {
                collection,
                key: key.to_string(),
                bytes,
            },
        ));
        Ok(())
    }

    /// Delete one metadata document in its own transaction, recording the
    /// compensation for a later rollback.
    fn delete_meta(
        &self,
        collection: MetaCollection,
        key: &str,
        log: &mut Vec<Compensation>,
    ) -> Result<()> {
        let txn = self.db.begin_write().map_err(store_err)?;
        let prior = {
            let mut table = txn.open_table(collection.def()).map_err(store_err)?;
            table.remove(key).map_err(store_err)?.map(|g| g.value().to_vec())
        };
        txn.commit().map_err(store_err)?;
        if let Some(bytes) = prior {
            log.push(Compensation::Restore {
                collection,
                key: key.to_string(),
                bytes,
            });
        }
        Ok(())
    }

    /// Replay the compensation log in reverse order. Each undo runs in
    /// its own transaction; an undo failure is logged and skipped so the
    /// rest of the log still applies.
    fn compensate(&self, log: &[Compensation]) {
        warn!(steps = log.len(), "rolling back applied schema steps");
        for entry in log.iter().rev() {
            let outcome = match entry {
                Compensation::Restore {
                    collection,
                    key,
                    bytes,
                } => self.raw_put(*collection, key, bytes),
                Compensation::Remove { collection, key } => self.raw_remove(*collection, key),
            };
            if let Err(e) = outcome {
                error!(error = %e, "compensation step failed, continuing");
            }
        }
    }

    fn raw_put(&self, collection: MetaCollection, key: &str, bytes: &[u8]) -> Result<()> {
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(collection.def()).map_err(store_err)?;
            table.insert(key, bytes).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)
    }

    fn raw_remove(&self, collection: MetaCollection, key: &str) -> Result<()> {
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(collection.def()).map_err(store_err)?;
            table.remove(key).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)
    }

    fn apply_steps(
        &self,
        changes: &SchemaChangeSet,
        log: &mut Vec<Compensation>,
    ) -> Result<()> {
        for change in changes.create_tables.iter().chain(&changes.update_tables) {
            let bytes = bincode::serialize(&change.table).map_err(store_err)?;
            self.put_meta(
                MetaCollection::Tables,
                &change.table.id.to_string(),
                &bytes,
                log,
            )?;
        }
        for change in &changes.delete_tables {
            self.delete_meta(MetaCollection::Tables, &change.table.id.to_string(), log)?;
        }
        for change in changes.create_columns.iter().chain(&changes.update_columns) {
            let bytes = bincode::serialize(&change.column).map_err(store_err)?;
            self.put_meta(
                MetaCollection::Columns,
                &change.column.id.to_string(),
                &bytes,
                log,
            )?;
        }
        for change in &changes.delete_columns {
            self.delete_meta(MetaCollection::Columns, &change.column.id.to_string(), log)?;
            self.strip_field(&change.table_name, &change.column.name)?;
        }
        for change in changes
            .create_relations
            .iter()
            .chain(&changes.update_relations)
        {
            let bytes = bincode::serialize(&change.relation).map_err(store_err)?;
            self.put_meta(
                MetaCollection::Relations,
                &change.relation.id.to_string(),
                &bytes,
                log,
            )?;
        }
        for change in &changes.delete_relations {
            self.delete_meta(
                MetaCollection::Relations,
                &change.relation.id.to_string(),
                log,
            )?;
        }
        self.embed_ownership_arrays(log)?;

        // Data drops cannot be compensated, so they run once every
        // metadata step has succeeded.
        for change in &changes.delete_tables {
            self.drop_collection(&change.table.name)?;
        }
        Ok(())
    }

    fn drop_collection(&self, collection: &str) -> Result<()> {
        let name = tables::data_table_name(collection);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let txn = self.db.begin_write().map_err(store_err)?;
        match txn.delete_table(def) {
            Ok(_) | Err(TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(store_err(e)),
        }
        txn.commit().map_err(store_err)
    }

    /// Rewrite the embedded `column_ids`/`relation_ids` arrays on every
    /// table document to match the column/relation collections. A column
    /// or relation pointing at a missing table document is an error.
    fn embed_ownership_arrays(&self, log: &mut Vec<Compensation>) -> Result<()> {
        let defs = self.read_definitions()?;
        for column in &defs.columns {
            if !defs.tables.iter().any(|t| t.id == column.table_id) {
                return Err(Error::storage(format!(
                    "column '{}' references missing table document {}",
                    column.name, column.table_id
                )));
            }
        }
        for relation in &defs.relations {
            if !defs.tables.iter().any(|t| t.id == relation.source_table_id) {
                return Err(Error::storage(format!(
                    "relation '{}' references missing table document {}",
                    relation.property_name, relation.source_table_id
                )));
            }
        }
        for table in &defs.tables {
            let mut doc = table.clone();
            doc.column_ids = defs.columns_of(table).map(|c| c.id).collect();
            doc.relation_ids = defs.relations_of(table).map(|r| r.id).collect();
            if doc.column_ids != table.column_ids || doc.relation_ids != table.relation_ids {
                let bytes = bincode::serialize(&doc).map_err(store_err)?;
                self.put_meta(MetaCollection::Tables, &doc.id.to_string(), &bytes, log)?;
            }
        }
        Ok(())
    }

    fn read_definitions(&self) -> Result<StoredDefinitions> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let mut defs = StoredDefinitions::default();
        let table = txn.open_table(tables::TABLE_DEFS).map_err(store_err)?;
        for entry in table.iter().map_err(store_err)? {
            let (key, bytes) = entry.map_err(store_err)?;
            match bincode::deserialize::<TableDefinition>(bytes.value()) {
                Ok(def) => defs.tables.push(def),
                Err(e) => error!(key = key.value(), "bad table document: {e}"),
            }
        }
        let table = txn.open_table(tables::COLUMN_DEFS).map_err(store_err)?;
        for entry in table.iter().map_err(store_err)? {
            let (key, bytes) = entry.map_err(store_err)?;
            match bincode::deserialize::<ColumnDefinition>(bytes.value()) {
                Ok(def) => defs.columns.push(def),
                Err(e) => error!(key = key.value(), "bad column document: {e}"),
            }
        }
        let table = txn.open_table(tables::RELATION_DEFS).map_err(store_err)?;
        for entry in table.iter().map_err(store_err)? {
            let (key, bytes) = entry.map_err(store_err)?;
            match bincode::deserialize::<RelationDefinition>(bytes.value()) {
                Ok(def) => defs.relations.push(def),
                Err(e) => error!(key = key.value(), "bad relation document: {e}"),
            }
        }
        Ok(defs)
    }

    // ---- Data collections ----

    fn scan_collection(&self, collection: &str) -> Result<Vec<Record>> {
        let name = tables::data_table_name(collection);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(store_err(e)),
        };
        let mut docs = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (key, bytes) = entry.map_err(store_err)?;
            match serde_json::from_slice::<Record>(bytes.value()) {
                Ok(doc) => docs.push(doc),
                Err(e) => error!(collection, key = key.value(), "bad document: {e}"),
            }
        }
        Ok(docs)
    }

    fn get_document(&self, collection: &str, pk: &Value) -> Result<Option<Record>> {
        let name = tables::data_table_name(collection);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(store_err(e)),
        };
        match table.get(value_key(pk).as_str()).map_err(store_err)? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(bytes.value()).map_err(store_err)?,
            )),
            None => Ok(None),
        }
    }

    fn put_document(&self, collection: &str, key: &str, doc: &Record) -> Result<()> {
        let name = tables::data_table_name(collection);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let bytes = serde_json::to_vec(doc).map_err(store_err)?;
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(def).map_err(store_err)?;
            table.insert(key, bytes.as_slice()).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)
    }

    fn remove_documents(&self, collection: &str, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let name = tables::data_table_name(collection);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = match txn.open_table(def) {
                Ok(table) => table,
                Err(e) => return Err(store_err(e)),
            };
            for key in keys {
                table.remove(key.as_str()).map_err(store_err)?;
            }
        }
        txn.commit().map_err(store_err)
    }

    /// Remove a retired field from every document of a collection.
    fn strip_field(&self, collection: &str, field: &str) -> Result<()> {
        let name = tables::data_table_name(collection);
        let def: RedbTable<&str, &[u8]> = RedbTable::new(&name);
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = match txn.open_table(def) {
                Ok(table) => table,
                Err(e) => return Err(store_err(e)),
            };
            let mut rewritten: Vec<(String, Vec<u8>)> = Vec::new();
            for entry in table.iter().map_err(store_err)? {
                let (key, bytes) = entry.map_err(store_err)?;
                let mut doc: Record = serde_json::from_slice(bytes.value()).map_err(store_err)?;
                if doc.remove(field).is_some() {
                    rewritten.push((
                        key.value().to_string(),
                        serde_json::to_vec(&doc).map_err(store_err)?,
                    ));
                }
            }
            for (key, bytes) in rewritten {
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(store_err)?;
            }
        }
        txn.commit().map_err(store_err)
    }

    /// The `$lookup` stage: gather the related documents for one parent.
    fn lookup(&self, parent: &Record, step: &JoinStep) -> Result<Vec<Value>> {
        let rel = &step.relation;
        if let Some(junction) = &rel.junction {
            let owner = parent.get(&rel.source_pk).cloned().unwrap_or(Value::Null);
            let mut related = Vec::new();
            for pair in self.scan_collection(&junction.table)? {
                let linked = pair
                    .get(&junction.source_column)
                    .is_some_and(|v| values_equal(v, &owner));
                if !linked {
                    continue;
                }
                if let Some(target_key) = pair.get(&junction.target_column) {
                    if let Some(doc) = self.get_document(&rel.target_table, target_key)? {
                        related.push(Value::Object(doc));
                    }
                }
            }
            return Ok(related);
        }
        let fk = rel
            .foreign_key
            .as_deref()
            .ok_or_else(|| Error::internal("lookup step without foreign key"))?;
        if rel.foreign_key_on_target {
            let owner = parent.get(&rel.source_pk).cloned().unwrap_or(Value::Null);
            Ok(self
                .scan_collection(&rel.target_table)?
                .into_iter()
                .filter(|doc| doc.get(fk).is_some_and(|v| values_equal(v, &owner)))
                .map(Value::Object)
                .collect())
        } else {
            match parent.get(fk) {
                None | Some(Value::Null) => Ok(Vec::new()),
                Some(key) => Ok(self
                    .get_document(&rel.target_table, key)?
                    .map(Value::Object)
                    .into_iter()
                    .collect()),
            }
        }
    }

    /// Attach one lookup stage to every document at the step's parent
    /// path, unwinding to a single value for to-one semantics.
    fn apply_lookup(&self, docs: &mut Vec<Record>, step: &JoinStep) -> Result<()> {
        let (property, parent_path) = step
            .path
            .split_last()
            .ok_or_else(|| Error::internal("empty lookup path"))?;
        let unwind = !step.relation.kind.is_to_many();
        let mut stage = |doc: &mut Record| -> Result<()> {
            let mut related = self.lookup(doc, step)?;
            let value = if unwind {
                related.pop().unwrap_or(Value::Null)
            } else {
                Value::Array(related)
            };
            doc.insert(property.clone(), value);
            Ok(())
        };
        for doc in docs.iter_mut() {
            visit_path(doc, parent_path, &mut stage)?;
        }
        Ok(())
    }

    fn next_sequence(&self, collection: &str) -> Result<u64> {
        let txn = self.db.begin_write().map_err(store_err)?;
        let next = {
            let mut seq = txn.open_table(tables::SEQUENCES).map_err(store_err)?;
            let current = seq
                .get(collection)
                .map_err(store_err)?
                .map_or(0, |v| v.value());
            let next = current + 1;
            seq.insert(collection, next).map_err(store_err)?;
            next
        };
        txn.commit().map_err(store_err)?;
        Ok(next)
    }
}

/// Walk a parent path through nested documents, fanning out over arrays.
fn visit_path(
    doc: &mut Record,
    path: &[String],
    f: &mut impl FnMut(&mut Record) -> Result<()>,
) -> Result<()> {
    let Some((head, rest)) = path.split_first() else {
        return f(doc);
    };
    if matches!(doc.get(head), Some(Value::Object(_))) {
        let Some(Value::Object(mut taken)) = doc.remove(head) else {
            return Ok(());
        };
        let result = visit_path(&mut taken, rest, f);
        doc.insert(head.clone(), Value::Object(taken));
        return result;
    }
    if let Some(Value::Array(items)) = doc.get_mut(head) {
        for item in items {
            if let Value::Object(map) = item {
                visit_path(map, rest, f)?;
            }
        }
    }
    Ok(())
}

/// Project documents down to the requested fields, per lookup level.
fn project(docs: &mut [Record], plan: &SelectPlan) {
    prune(docs, &[], &plan.base_fields, &plan.joins);
}

fn prune(docs: &mut [Record], prefix: &[String], fields: &[String], joins: &[JoinStep]) {
    let children: Vec<&JoinStep> = joins
        .iter()
        .filter(|s| s.path.len() == prefix.len() + 1 && s.path.starts_with(prefix))
        .collect();
    for doc in docs.iter_mut() {
        if !fields.is_empty() {
            let keep: Vec<String> = fields
                .iter()
                .cloned()
                .chain(children.iter().filter_map(|s| s.path.last().cloned()))
                .collect();
            doc.retain(|k, _| keep.iter().any(|f| f == k));
        }
    }
    for step in children {
        let property = step.path.last().expect("lookup path is never empty");
        for doc in docs.iter_mut() {
            match doc.get_mut(property) {
                Some(Value::Object(map)) => {
                    let mut nested = vec![std::mem::take(map)];
                    prune(&mut nested, &step.path, &step.fields, joins);
                    *map = nested.pop().unwrap_or_default();
                }
                Some(Value::Array(items)) => {
                    let mut nested: Vec<Record> = items
                        .iter_mut()
                        .filter_map(|v| v.as_object_mut().map(std::mem::take))
                        .collect();
                    prune(&mut nested, &step.path, &step.fields, joins);
                    *items = nested.into_iter().map(Value::Object).collect();
                }
                _ => {}
            }
        }
    }
}

fn junction_pair_key(junction: &JunctionNames, owner: &Value, target: &Value) -> String {
    let mut pair = [
        (junction.source_column.as_str(), value_key(owner)),
        (junction.target_column.as_str(), value_key(target)),
    ];
    pair.sort_by(|a, b| a.0.cmp(b.0));
    tables::junction_key(&pair[0].1, &pair[1].1)
}

#[async_trait]
impl StorageAdapter for DocumentStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn load_definitions(&self) -> Result<StoredDefinitions> {
        self.read_definitions()
    }

    async fn apply_schema(&self, changes: &SchemaChangeSet) -> Result<AppliedCounts> {
        if changes.is_empty() {
            debug!("schema change set empty, nothing to apply");
            return Ok(AppliedCounts::default());
        }
        let mut log = Vec::new();
        if let Err(e) = self.apply_steps(changes, &mut log) {
            self.compensate(&log);
            return Err(Error::ReconcileTransactionFailed(e.to_string()));
        }
        let counts = AppliedCounts::from_change_set(changes);
        info!(writes = counts.total(), "schema change sequence applied");
        Ok(counts)
    }

    async fn sync_enum_options(&self, table_name: &str, column: &ColumnDefinition) -> Result<()> {
        // Documents carry no physical enum constraint.
        debug!(table = table_name, column = %column.name, "enum sync skipped");
        Ok(())
    }

    async fn fetch(&self, plan: &SelectPlan) -> Result<Vec<Record>> {
        let mut docs = self.scan_collection(&plan.table)?;
        if let Some(filter) = &plan.filter {
            docs.retain(|d| filter.matches(d));
        }
        sort_records(&mut docs, &plan.sort);
        if plan.relation_sort.is_empty() {
            plan.page.apply(&mut docs);
        }
        for step in &plan.joins {
            self.apply_lookup(&mut docs, step)?;
        }
        if !plan.relation_sort.is_empty() {
            sort_records(&mut docs, &plan.relation_sort);
            plan.page.apply(&mut docs);
        }
        project(&mut docs, plan);
        Ok(docs)
    }

    async fn count(&self, table_name: &str, filter: Option<&FilterNode>) -> Result<u64> {
        let docs = self.scan_collection(table_name)?;
        let count = match filter {
            Some(f) => docs.iter().filter(|d| f.matches(d)).count(),
            None => docs.len(),
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
                    "missing primary key '{}' for collection '{}'",
                    target.primary_key, target.table
                )));
            }
        };
        if self.get_document(&target.table, &pk)?.is_some() {
            return Err(Error::storage(format!(
                "duplicate primary key '{}' in collection '{}'",
                value_key(&pk),
                target.table
            )));
        }
        row.insert(target.primary_key.clone(), pk.clone());
        let now = epoch_millis();
        row.entry("created_at".to_string())
            .or_insert_with(|| Value::from(now));
        row.insert("updated_at".to_string(), Value::from(now));
        self.put_document(&target.table, &value_key(&pk), &row)?;
        Ok(pk)
    }

    async fn update_rows(
        &self,
        target: &WriteTarget,
        filter: &FilterNode,
        mut changes: Record,
    ) -> Result<u64> {
        changes.remove(&target.primary_key);
        changes.insert("updated_at".to_string(), Value::from(epoch_millis()));
        let mut affected = 0u64;
        for mut doc in self.scan_collection(&target.table)? {
            if !filter.matches(&doc) {
                continue;
            }
            let Some(pk) = doc.get(&target.primary_key).cloned() else {
                continue;
            };
            for (field, value) in changes.clone() {
                doc.insert(field, value);
            }
            self.put_document(&target.table, &value_key(&pk), &doc)?;
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete_rows(&self, target: &WriteTarget, filter: &FilterNode) -> Result<u64> {
        let keys: Vec<String> = self
            .scan_collection(&target.table)?
            .into_iter()
            .filter(|doc| filter.matches(doc))
            .filter_map(|doc| doc.get(&target.primary_key).map(value_key))
            .collect();
        self.remove_documents(&target.table, &keys)?;
        Ok(keys.len() as u64)
    }

    async fn replace_junction(
        &self,
        junction: &JunctionNames,
        owner: &Value,
        targets: &[Value],
    ) -> Result<()> {
        self.clear_junction(junction, owner).await?;
        for target in targets {
            let mut pair = Record::new();
            pair.insert(junction.source_column.clone(), owner.clone());
            pair.insert(junction.target_column.clone(), target.clone());
            let key = junction_pair_key(junction, owner, target);
            self.put_document(&junction.table, &key, &pair)?;
        }
        debug!(
            junction = %junction.table,
            owner = %value_key(owner),
            count = targets.len(),
            "junction documents replaced"
        );
        Ok(())
    }

    async fn clear_junction(&self, junction: &JunctionNames, owner: &Value) -> Result<u64> {
        let keys: Vec<String> = self
            .scan_collection(&junction.table)?
            .iter()
            .filter(|pair| {
                pair.get(&junction.source_column)
                    .is_some_and(|v| values_equal(v, owner))
            })
            .filter_map(|pair| {
                pair.get(&junction.target_column)
                    .map(|t| junction_pair_key(junction, owner, t))
            })
            .collect();
        self.remove_documents(&junction.table, &keys)?;
        Ok(keys.len() as u64)
    }

    async fn junction_targets(&self, junction: &JunctionNames, owner: &Value) -> Result<Vec<Value>> {
        Ok(self
            .scan_collection(&junction.table)?
            .into_iter()
            .filter(|pair| {
                pair.get(&junction.source_column)
                    .is_some_and(|v| values_equal(v, owner))
            })
            .filter_map(|pair| pair.get(&junction.target_column).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ColumnChange, TableChange};
    use crate::definitions::DataType;
    use fabrica_common::TableId;
    use serde_json::json;

    async fn open_store() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            data_path: dir.path().join("docs.redb"),
            ..StoreConfig::default()
        };
        let store = DocumentStore::open(&config).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_ownership_arrays_embedded() {
        let (_dir, store) = open_store().await;
        let table = TableDefinition::new("article");
        let table_id = table.id;
        let mut changes = SchemaChangeSet::default();
        changes.create_tables.push(TableChange { table });
        changes.create_columns.push(ColumnChange {
            column: ColumnDefinition::new(table_id, "title", DataType::Varchar),
            table_name: "article".into(),
        });
        store.apply_schema(&changes).await.unwrap();

        let defs = store.load_definitions().await.unwrap();
        let stored = defs.table_by_name("article").unwrap();
        assert_eq!(stored.column_ids.len(), 1);
        assert_eq!(stored.column_ids[0], defs.columns[0].id);
    }

    #[tokio::test]
    async fn test_failed_sequence_is_compensated() {
        let (_dir, store) = open_store().await;
        let table = TableDefinition::new("article");
        let mut changes = SchemaChangeSet::default();
        changes.create_tables.push(TableChange { table });
        // Column pointing at a table that is never created: the embed
        // pass fails, and the created table document must be rolled back.
        changes.create_columns.push(ColumnChange {
            column: ColumnDefinition::new(TableId::new(), "orphan", DataType::Int),
            table_name: "ghost".into(),
        });
        let err = store.apply_schema(&changes).await.unwrap_err();
        assert!(matches!(err, Error::ReconcileTransactionFailed(_)));

        let defs = store.load_definitions().await.unwrap();
        assert!(defs.tables.is_empty());
        assert!(defs.columns.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_unwinds_to_one() {
        let (_dir, store) = open_store().await;
        let author_target = WriteTarget {
            table: "author".into(),
            primary_key: "id".into(),
            generation: PkGeneration::Provided,
        };
        let post_target = WriteTarget {
            table: "post".into(),
            primary_key: "id".into(),
            generation: PkGeneration::Provided,
        };
        let author: Record = json!({"id": 7, "name": "nina"}).as_object().unwrap().clone();
        store.insert_row(&author_target, author).await.unwrap();
        let post: Record = json!({"id": 1, "title": "hello", "author_id": 7})
            .as_object()
            .unwrap()
            .clone();
        store.insert_row(&post_target, post).await.unwrap();

        let plan = SelectPlan {
            table: "post".into(),
            base_fields: vec!["id".into(), "title".into()],
            joins: vec![JoinStep {
                path: vec!["author".into()],
                relation: crate::plan::JoinRelation {
                    kind: crate::definitions::RelationKind::ManyToOne,
                    source_table: "post".into(),
                    target_table: "author".into(),
                    property: "author".into(),
                    source_pk: "id".into(),
                    target_pk: "id".into(),
                    foreign_key: Some("author_id".into()),
                    foreign_key_on_target: false,
                    junction: None,
                },
                fields: vec!["name".into()],
            }],
            filter: None,
            sort: Vec::new(),
            relation_sort: Vec::new(),
            page: crate::plan::Page::default(),
        };
        let docs = store.fetch(&plan).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["author"]["name"], json!("nina"));
        // Projection kept only the requested fields
        assert!(!docs[0].contains_key("author_id"));
        assert_eq!(docs[0]["author"].as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_junction_replace_exact_set() {
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
}
