//! Fabrica Cache - compiled metadata for the whole cluster
//!
//! Loads reconciled definitions into an immutable, query-ready compiled
//! form and keeps every process instance eventually consistent: one
//! instance reloads behind a named lock, publishes the compiled view on
//! a broadcast channel, and every peer installs the payload without
//! touching the durable store.

pub mod compiled;
pub mod service;
pub mod synthesis;

// Re-exports
pub use compiled::{CompiledMetadata, CompiledRelation, CompiledTable, compile};
pub use service::{MetadataCache, ReloadOutcome};
pub use synthesis::synthesize_inverses;
