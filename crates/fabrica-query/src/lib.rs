//! Fabrica Query - the unified query/mutation translator
//!
//! Takes backend-agnostic query and mutation specs (field lists with
//! dot-paths, filter trees, sort, pagination), resolves them against
//! compiled metadata into self-contained plans, and orchestrates
//! cascading writes across to-one, one-to-many, and many-to-many
//! relations. The storage backend only ever sees resolved plans.

pub mod executor;
pub mod filter;
pub mod spec;
pub mod translate;

// Re-exports
pub use executor::QueryEngine;
pub use filter::parse_filter;
pub use spec::{DeleteSpec, InsertSpec, QuerySpec, SelectMeta, SelectResult, UpdateSpec};
pub use translate::build_select_plan;
