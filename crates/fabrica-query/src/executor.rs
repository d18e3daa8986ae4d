//! Query execution and cascading writes
//!
//! The engine validates a spec, resolves it into a plan against the
//! compiled metadata, and hands the plan to the storage adapter. Writes
//! cascade in a fixed order: to-one references resolve to foreign keys
//! on the owner, one-to-many children get their foreign key set after
//! the owner exists, and many-to-many junction rows are replaced
//! wholesale so the stored set equals the provided set exactly.

use crate::filter::{parse_filter, referenced_fields};
use crate::spec::{DeleteSpec, InsertSpec, QuerySpec, SelectMeta, SelectResult, UpdateSpec};
use crate::translate::build_select_plan;
use fabrica_cache::{CompiledMetadata, CompiledRelation, CompiledTable, MetadataCache};
use fabrica_common::{Error, QueryConfig, Result};
use fabrica_store::{FilterNode, Page, Record, SelectPlan, StorageAdapter};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// The unified query/mutation entry point
pub struct QueryEngine {
    adapter: Arc<dyn StorageAdapter>,
    cache: Arc<MetadataCache>,
    config: QueryConfig,
}

impl QueryEngine {
    /// Create an engine over one backend and one metadata cache
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        cache: Arc<MetadataCache>,
        config: QueryConfig,
    ) -> Self {
        Self {
            adapter,
            cache,
            config,
        }
    }

    /// Execute a select.
    pub async fn select(&self, spec: &QuerySpec) -> Result<SelectResult> {
        let meta = self.cache.get_metadata().await?;
        let plan = build_select_plan(&meta, spec, self.config.default_limit)?;
        let data = self.adapter.fetch(&plan).await?;
        let meta_out = if spec.with_meta {
            let total = self.adapter.count(&plan.table, plan.filter.as_ref()).await?;
            Some(SelectMeta { total })
        } else {
            None
        };
        Ok(SelectResult {
            data,
            meta: meta_out,
        })
    }

    /// Insert one or more records, cascading embedded relation values.
    /// Returns the primary keys in input order.
    pub async fn insert(&self, spec: &InsertSpec) -> Result<Vec<Value>> {
        let meta = self.cache.get_metadata().await?;
        let table = require_table(&meta, &spec.table)?;
        let mut keys = Vec::with_capacity(spec.records.len());
        for record in &spec.records {
            keys.push(
                self.write_record(&meta, table, record.clone(), None)
                    .await?,
            );
        }
        Ok(keys)
    }

    /// Update records by key or filter, cascading embedded relation
    /// values per owner. Returns the affected count.
    pub async fn update(&self, spec: &UpdateSpec) -> Result<u64> {
        let meta = self.cache.get_metadata().await?;
        let table = require_table(&meta, &spec.table)?;
        let keys = self
            .resolve_keys(table, spec.key.as_ref(), spec.filter.as_ref())
            .await?;
        for key in &keys {
            self.write_record(&meta, table, spec.changes.clone(), Some(key.clone()))
                .await?;
        }
        Ok(keys.len() as u64)
    }

    /// Delete records by key or filter, clearing their junction rows.
    /// Returns the removed count.
    pub async fn delete(&self, spec: &DeleteSpec) -> Result<u64> {
        let meta = self.cache.get_metadata().await?;
        let table = require_table(&meta, &spec.table)?;
        let keys = self
            .resolve_keys(table, spec.key.as_ref(), spec.filter.as_ref())
            .await?;
        let target = table.write_target();
        let mut removed = 0u64;
        for key in &keys {
            for relation in &table.relations {
                if let Some(junction) = &relation.junction {
                    self.adapter.clear_junction(junction, key).await?;
                }
            }
            removed += self
                .adapter
                .delete_rows(&target, &FilterNode::eq(target.primary_key.clone(), key.clone()))
                .await?;
        }
        Ok(removed)
    }

    /// Resolve the primary keys a mutation addresses.
    async fn resolve_keys(
        &self,
        table: &CompiledTable,
        key: Option<&Value>,
        filter: Option<&Value>,
    ) -> Result<Vec<Value>> {
        if let Some(key) = key {
            return Ok(vec![key.clone()]);
        }
        let Some(raw) = filter else {
            return Err(Error::invalid_query(
                "mutation requires a key or a filter",
            ));
        };
        let filter = parse_filter(raw)?;
        for field in referenced_fields(&filter) {
            if table.column(field).is_none() {
                return Err(Error::invalid_query(format!(
                    "unknown filter field '{}' on table '{}'",
                    field, table.name
                )));
            }
        }
        let target = table.write_target();
        let plan = SelectPlan {
            table: table.name.clone(),
            base_fields: vec![target.primary_key.clone()],
            joins: Vec::new(),
            filter: Some(filter),
            sort: Vec::new(),
            relation_sort: Vec::new(),
            page: Page::default(),
        };
        Ok(self
            .adapter
            .fetch(&plan)
            .await?
            .into_iter()
            .filter_map(|mut row| row.remove(&target.primary_key))
            .collect())
    }

    /// Write one owner record plus its embedded relation values.
    ///
    /// `existing` carries the primary key for updates; `None` inserts.
    fn write_record<'a>(
        &'a self,
        meta: &'a CompiledMetadata,
        table: &'a CompiledTable,
        payload: Record,
        existing: Option<Value>,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let is_update = existing.is_some();
            let mut scalars = Record::new();
            let mut to_one: Vec<(&CompiledRelation, Value)> = Vec::new();
            let mut to_many: Vec<(&CompiledRelation, Value)> = Vec::new();

            for (field, value) in payload {
                if let Some(relation) = table.relation(&field) {
                    if relation.kind.is_to_many() {
                        to_many.push((relation, value));
                    } else {
                        to_one.push((relation, value));
                    }
                } else if let Some(column) = table.column(&field) {
                    if is_update && !column.is_updatable && !column.is_primary {
                        debug!(
                            table = %table.name,
                            column = %field,
                            "non-updatable column dropped from update payload"
                        );
                        continue;
                    }
                    scalars.insert(field, value);
                } else {
                    return Err(Error::invalid_query(format!(
                        "unknown field '{}' on table '{}'",
                        field, table.name
                    )));
                }
            }

            // (1) To-one references become foreign keys on the owner.
            for (relation, value) in to_one {
                if relation.foreign_key_on_target() {
                    // A synthesized one-to-one inverse: the key lives on
                    // the other side, handled like a child reference.
                    to_many.push((relation, Value::Array(vec![value])));
                    continue;
                }
                let fk = relation.foreign_key_column.clone().ok_or_else(|| {
                    Error::internal(format!(
                        "to-one relation '{}' without a foreign key",
                        relation.property_name
                    ))
                })?;
                let reference = self
                    .resolve_reference(meta, &relation.target_table, value)
                    .await?;
                scalars.insert(fk, reference);
            }

            // (2) Write the owner itself.
            let target = table.write_target();
            let owner_key = match existing {
                None => self.adapter.insert_row(&target, scalars).await?,
                Some(key) => {
                    let affected = self
                        .adapter
                        .update_rows(
                            &target,
                            &FilterNode::eq(target.primary_key.clone(), key.clone()),
                            scalars,
                        )
                        .await?;
                    if affected == 0 {
                        return Err(Error::RecordNotFound {
                            table: table.name.clone(),
                            key: fabrica_store::plan::value_key(&key),
                        });
                    }
                    key
                }
            };

            // (3) Children and junctions, now that the owner exists.
            for (relation, value) in to_many {
                let entries = match value {
                    Value::Array(entries) => entries,
                    Value::Null => Vec::new(),
                    other => {
                        return Err(Error::invalid_query(format!(
                            "relation '{}' expects an array, got {other}",
                            relation.property_name
                        )));
                    }
                };
                if let Some(junction) = &relation.junction {
                    let mut keys = Vec::with_capacity(entries.len());
                    for entry in entries {
                        keys.push(
                            self.resolve_reference(meta, &relation.target_table, entry)
                                .await?,
                        );
                    }
                    self.adapter
                        .replace_junction(junction, &owner_key, &keys)
                        .await?;
                } else {
                    self.link_children(meta, relation, &owner_key, entries)
                        .await?;
                }
            }

            Ok(owner_key)
        })
    }

    /// Set the foreign key of each referenced child to the owner.
    async fn link_children(
        &self,
        meta: &CompiledMetadata,
        relation: &CompiledRelation,
        owner_key: &Value,
        entries: Vec<Value>,
    ) -> Result<()> {
        let fk = relation.foreign_key_column.clone().ok_or_else(|| {
            Error::internal(format!(
                "to-many relation '{}' without a foreign key",
                relation.property_name
            ))
        })?;
        let child_table = require_table(meta, &relation.target_table)?;
        let child_target = child_table.write_target();
        for entry in entries {
            match entry {
                Value::Object(mut child) => {
                    // Embedded object: insert it with the key preset, or
                    // relink an existing child by its primary key.
                    let existing_key = child
                        .get(&child_target.primary_key)
                        .cloned()
                        .filter(|v| !v.is_null());
                    child.insert(fk.clone(), owner_key.clone());
                    self.write_record(meta, child_table, child, existing_key)
                        .await?;
                }
                key => {
                    let mut changes = Record::new();
                    changes.insert(fk.clone(), owner_key.clone());
                    let affected = self
                        .adapter
                        .update_rows(
                            &child_target,
                            &FilterNode::eq(child_target.primary_key.clone(), key.clone()),
                            changes,
                        )
                        .await?;
                    if affected == 0 {
                        return Err(Error::RecordNotFound {
                            table: child_table.name.clone(),
                            key: fabrica_store::plan::value_key(&key),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Turn a to-one/junction reference value into a primary key:
    /// scalars pass through, an object with a key uses it, an object
    /// without one is inserted first.
    async fn resolve_reference(
        &self,
        meta: &CompiledMetadata,
        table_name: &str,
        value: Value,
    ) -> Result<Value> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Object(record) => {
                let table = require_table(meta, table_name)?;
                let pk_column = table.write_target().primary_key;
                match record.get(&pk_column).cloned().filter(|v| !v.is_null()) {
                    Some(key) => Ok(key),
                    None => self.write_record(meta, table, record, None).await,
                }
            }
            scalar => Ok(scalar),
        }
    }
}

fn require_table<'a>(meta: &'a CompiledMetadata, name: &str) -> Result<&'a CompiledTable> {
    meta.table(name)
        .ok_or_else(|| Error::TableNotFound(name.to_string()))
}
