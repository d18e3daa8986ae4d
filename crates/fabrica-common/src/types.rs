//! Core type definitions for Fabrica
//!
//! Identifier newtypes for the three metadata collections, the backend
//! discriminant, and time helpers.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for a table definition
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct TableId(Uuid);

/// Unique identifier for a column definition
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct ColumnId(Uuid);

/// Unique identifier for a relation definition
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct RelationId(Uuid);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            /// Generate a new random id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

impl_id!(TableId);
impl_id!(ColumnId);
impl_id!(RelationId);

/// Identifier for one process instance, used to tag broadcast payloads
/// so subscribers can ignore their own publications.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a fresh random instance id
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from a caller-supplied identifier
    pub fn from_name(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the instance id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

/// Which storage engine family is active
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Relational engine: normalized rows, foreign-key columns, joins
    Relational,
    /// Document engine: JSON documents, lookups, embedded id arrays
    Document,
}

impl BackendKind {
    /// Short lowercase name, used in log lines and cache keys
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Document => "document",
        }
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
