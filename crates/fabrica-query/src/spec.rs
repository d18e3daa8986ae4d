//! Backend-agnostic query and mutation specs
//!
//! These are the shapes callers hand to the engine, typically
//! deserialized straight from a request body. Pagination uses signed
//! integers so out-of-range inputs are rejected here rather than
//! wrapping silently.

use fabrica_store::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A select request
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuerySpec {
    pub table: String,
    /// Field list; `None` or `"*"` expands to all non-hidden scalar
    /// columns. Dot-paths traverse relations (`"author.name"`).
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    /// Raw filter tree (`_and`/`_or`/`_not` plus operators)
    #[serde(default)]
    pub filter: Option<Value>,
    /// Sort keys; a leading `-` means descending
    #[serde(default)]
    pub sort: Option<Vec<String>>,
    /// 1-based page number
    #[serde(default)]
    pub page: Option<i64>,
    /// Page size; 0 means unbounded, absent applies the default
    #[serde(default)]
    pub limit: Option<i64>,
    /// Whether to compute result metadata (total count)
    #[serde(default)]
    pub with_meta: bool,
}

impl QuerySpec {
    /// A spec selecting everything from one table
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table: name.into(),
            ..Self::default()
        }
    }

    /// Set the field list
    #[must_use]
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Set the filter tree
    #[must_use]
    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set the sort keys
    #[must_use]
    pub fn sort<I, S>(mut self, sort: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort = Some(sort.into_iter().map(Into::into).collect());
        self
    }

    /// Set the page number (1-based)
    #[must_use]
    pub const fn page(mut self, page: i64) -> Self {
        self.page = Some(page);
        self
    }

    /// Set the page size (0 = unbounded)
    #[must_use]
    pub const fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Request result metadata
    #[must_use]
    pub const fn with_meta(mut self) -> Self {
        self.with_meta = true;
        self
    }
}

/// An insert request; relation values may be embedded per record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InsertSpec {
    pub table: String,
    pub records: Vec<Record>,
}

impl InsertSpec {
    /// Insert a single record
    pub fn one(table: impl Into<String>, record: Record) -> Self {
        Self {
            table: table.into(),
            records: vec![record],
        }
    }

    /// Insert several records
    pub fn many(table: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            table: table.into(),
            records,
        }
    }
}

/// An update request addressing rows by key or by filter
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateSpec {
    pub table: String,
    /// Update one record by primary key
    #[serde(default)]
    pub key: Option<Value>,
    /// Update every record matching this filter tree
    #[serde(default)]
    pub filter: Option<Value>,
    /// Column changes and embedded relation values
    pub changes: Record,
}

impl UpdateSpec {
    /// Update one record by primary key
    pub fn by_key(table: impl Into<String>, key: Value, changes: Record) -> Self {
        Self {
            table: table.into(),
            key: Some(key),
            filter: None,
            changes,
        }
    }

    /// Update records matching a filter
    pub fn by_filter(table: impl Into<String>, filter: Value, changes: Record) -> Self {
        Self {
            table: table.into(),
            key: None,
            filter: Some(filter),
            changes,
        }
    }
}

/// A delete request addressing rows by key or by filter
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteSpec {
    pub table: String,
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub filter: Option<Value>,
}

impl DeleteSpec {
    /// Delete one record by primary key
    pub fn by_key(table: impl Into<String>, key: Value) -> Self {
        Self {
            table: table.into(),
            key: Some(key),
            filter: None,
        }
    }

    /// Delete records matching a filter
    pub fn by_filter(table: impl Into<String>, filter: Value) -> Self {
        Self {
            table: table.into(),
            key: None,
            filter: Some(filter),
        }
    }
}

/// Select result metadata
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectMeta {
    /// Records matching the filter, ignoring pagination
    pub total: u64,
}

/// A select result
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectResult {
    pub data: Vec<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<SelectMeta>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_spec_builder() {
        let spec = QuerySpec::table("post")
            .fields(["title", "author.name"])
            .filter(json!({"status": {"_eq": "published"}}))
            .sort(["-created_at"])
            .page(2)
            .limit(25)
            .with_meta();
        assert_eq!(spec.table, "post");
        assert_eq!(spec.fields.as_deref().unwrap().len(), 2);
        assert_eq!(spec.page, Some(2));
        assert!(spec.with_meta);
    }

    #[test]
    fn test_query_spec_from_json() {
        let spec: QuerySpec = serde_json::from_value(json!({
            "table": "user",
            "filter": {"age": {"_gt": 18}},
            "limit": 0
        }))
        .unwrap();
        assert_eq!(spec.table, "user");
        assert_eq!(spec.limit, Some(0));
        assert!(spec.fields.is_none());
        assert!(!spec.with_meta);
    }
}
