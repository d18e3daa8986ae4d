//! Fabrica Store - metadata collections and storage backends
//!
//! This crate owns everything that touches the durable store:
//! - The three metadata collections (table, column, relation definitions)
//! - Deterministic derived naming (foreign keys, junction tables)
//! - Schema change sets produced by the differ and applied by a backend
//! - Backend-agnostic query plans and their filter/sort semantics
//! - The `StorageAdapter` trait with two implementations: a relational
//!   engine (transactional) and a document engine (best-effort with a
//!   compensation log), both persisted in redb

pub mod adapter;
pub mod change;
pub mod definitions;
pub mod document;
pub mod naming;
pub mod plan;
pub mod relational;
pub mod tables;

// Re-exports
pub use adapter::{StorageAdapter, StoredDefinitions};
pub use change::{AppliedCounts, ColumnChange, RelationChange, SchemaChangeSet, TableChange};
pub use definitions::{
    ColumnDefinition, DataType, JunctionNames, RelationDefinition, RelationKind, TableDefinition,
};
pub use document::DocumentStore;
pub use plan::{
    CompareOp, FilterCond, FilterNode, JoinRelation, JoinStep, Page, PkGeneration, Record,
    SelectPlan, SortKey, WriteTarget,
};
pub use relational::RelationalStore;
