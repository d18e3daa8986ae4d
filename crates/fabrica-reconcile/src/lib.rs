//! Fabrica Reconcile - declarative schema reconciliation
//!
//! Diffs a declarative snapshot against the live metadata store and
//! applies the minimal set of creates/updates/deletes, auto-deriving
//! inverse relations and many-to-many junction tables. Reconciliation
//! runs are serialized cluster-wide by a named lock and applied under
//! the active backend's transaction semantics.

pub mod diff;
pub mod engine;
pub mod expand;
pub mod report;
pub mod snapshot;

// Re-exports
pub use diff::{SchemaDiff, diff_snapshot};
pub use engine::Reconciler;
pub use expand::{ExpandedRelation, expand_relations};
pub use report::{EnumSyncFailure, ReconcileReport, SkippedEntry};
pub use snapshot::{ColumnSpec, RelationSpec, SchemaSnapshot, TableSpec};
