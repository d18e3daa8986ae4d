//! Error types for Fabrica
//!
//! This module defines the common error taxonomy used throughout the engine.

use thiserror::Error;

/// Common result type for Fabrica operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Fabrica
#[derive(Debug, Error)]
pub enum Error {
    // Store errors
    #[error("store connection unavailable after {attempts} attempts: {reason}")]
    ConnectionUnavailable { attempts: u32, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("column not found: {table}.{column}")]
    ColumnNotFound { table: String, column: String },

    #[error("record not found: {table}#{key}")]
    RecordNotFound { table: String, key: String },

    // Reconciliation errors
    #[error("relation target not found: {property} on {table} references missing {target}")]
    TargetNotFound {
        table: String,
        property: String,
        target: String,
    },

    #[error("schema conflict on {table}: {reason}")]
    SchemaConflict { table: String, reason: String },

    #[error("reconcile transaction failed: {0}")]
    ReconcileTransactionFailed(String),

    // Coordination signals
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    // Query errors
    #[error("invalid query spec: {0}")]
    InvalidQuerySpec(String),

    // Internal errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid query spec error
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuerySpec(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a schema conflict error
    pub fn schema_conflict(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaConflict {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is a normal coordination signal rather than a failure
    #[must_use]
    pub fn is_lock_signal(&self) -> bool {
        matches!(self, Self::LockUnavailable(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TableNotFound(_)
                | Self::ColumnNotFound { .. }
                | Self::RecordNotFound { .. }
                | Self::TargetNotFound { .. }
        )
    }

    /// Check if this error aborts a whole reconciliation run
    ///
    /// Isolable errors (missing targets, per-relation conflicts) are
    /// collected into the report instead of aborting.
    #[must_use]
    pub fn is_reconcile_fatal(&self) -> bool {
        matches!(
            self,
            Self::ReconcileTransactionFailed(_)
                | Self::ConnectionUnavailable { .. }
                | Self::Storage(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
