//! Backend-agnostic query plans
//!
//! The translator resolves a query spec against compiled metadata into a
//! self-contained `SelectPlan`; adapters execute it with their own scan
//! and join mechanics. Value comparison and ordering semantics live here
//! so the two backends cannot drift apart on filter results.

use crate::definitions::{JunctionNames, RelationKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// One stored row/document
pub type Record = serde_json::Map<String, Value>;

/// Comparison and membership operators
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    IsNull,
}

/// A single `(field, operator, value)` condition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterCond {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

/// A translated filter tree
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
    Cond(FilterCond),
}

impl FilterNode {
    /// A conjunction of conditions (the flattened form)
    #[must_use]
    pub fn all_of(conds: Vec<FilterCond>) -> Self {
        Self::And(conds.into_iter().map(Self::Cond).collect())
    }

    /// Equality on a single field
    #[must_use]
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::Cond(FilterCond {
            field: field.into(),
            op: CompareOp::Eq,
            value,
        })
    }

    /// Evaluate this filter against a record
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::And(nodes) => nodes.iter().all(|n| n.matches(record)),
            Self::Or(nodes) => nodes.iter().any(|n| n.matches(record)),
            Self::Not(node) => !node.matches(record),
            Self::Cond(cond) => condition_matches(record.get(&cond.field), cond.op, &cond.value),
        }
    }
}

/// Evaluate one condition against a field value (`None` = field absent)
#[must_use]
pub fn condition_matches(field: Option<&Value>, op: CompareOp, operand: &Value) -> bool {
    let field = field.unwrap_or(&Value::Null);
    match op {
        CompareOp::Eq => values_equal(field, operand),
        CompareOp::Neq => !values_equal(field, operand),
        CompareOp::Gt => compare_values(field, operand) == Some(Ordering::Greater),
        CompareOp::Gte => matches!(
            compare_values(field, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => compare_values(field, operand) == Some(Ordering::Less),
        CompareOp::Lte => matches!(
            compare_values(field, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CompareOp::In => operand
            .as_array()
            .is_some_and(|set| set.iter().any(|v| values_equal(field, v))),
        CompareOp::NotIn => operand
            .as_array()
            .is_some_and(|set| !set.iter().any(|v| values_equal(field, v))),
        CompareOp::Contains => match (field.as_str(), operand.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
        CompareOp::IsNull => {
            let want_null = operand.as_bool().unwrap_or(true);
            field.is_null() == want_null
        }
    }
}

/// Equality with numeric cross-type comparison (1 == 1.0)
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

/// Total-ish ordering over JSON scalars; incomparable pairs yield `None`
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(_), Value::Number(_)) => {
            let (x, y) = (a.as_f64()?, b.as_f64()?);
            x.partial_cmp(&y)
        }
        _ => None,
    }
}

/// One sort key, parsed from `"field"` / `"-field"`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    /// Parse the `-` descending prefix
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        raw.strip_prefix('-').map_or_else(
            || Self {
                field: raw.to_string(),
                descending: false,
            },
            |field| Self {
                field: field.to_string(),
                descending: true,
            },
        )
    }

    /// Whether this key references a relation path
    #[must_use]
    pub fn is_relation_path(&self) -> bool {
        self.field.contains('.')
    }
}

/// Stable multi-key sort; nulls and incomparable values order first
pub fn sort_records(records: &mut [Record], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        for key in keys {
            let left = path_get(a, &key.field).unwrap_or(&Value::Null);
            let right = path_get(b, &key.field).unwrap_or(&Value::Null);
            let ord = match (left.is_null(), right.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => compare_values(left, right).unwrap_or(Ordering::Equal),
            };
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Walk a dotted path through nested objects
#[must_use]
pub fn path_get<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Pagination, already validated by the translator
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Page {
    /// `None` = unbounded
    pub limit: Option<u64>,
    pub offset: u64,
}

impl Page {
    /// Apply to an in-memory result set
    pub fn apply(&self, records: &mut Vec<Record>) {
        let offset = usize::try_from(self.offset).unwrap_or(usize::MAX);
        if offset > 0 {
            if offset >= records.len() {
                records.clear();
            } else {
                records.drain(..offset);
            }
        }
        if let Some(limit) = self.limit {
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            records.truncate(limit);
        }
    }
}

/// Everything an adapter needs to execute one relation hop
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRelation {
    pub kind: RelationKind,
    pub source_table: String,
    pub target_table: String,
    pub property: String,
    /// Primary-key column of the source table
    pub source_pk: String,
    /// Primary-key column of the target table
    pub target_pk: String,
    /// For many-to-one/one-to-one: the key column on the source side.
    /// For one-to-many and synthesized one-to-one inverses: the key
    /// column on the target side.
    pub foreign_key: Option<String>,
    /// True when `foreign_key` lives on the target table
    pub foreign_key_on_target: bool,
    /// For many-to-many: the junction collection, source-side first
    pub junction: Option<JunctionNames>,
}

/// One resolved relation hop of a field path
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinStep {
    /// Relation path from the root record, e.g. `["author"]` or
    /// `["author", "team"]`. Steps are ordered shallow-to-deep.
    pub path: Vec<String>,
    pub relation: JoinRelation,
    /// Scalar fields to keep on the joined records; empty = keep all
    pub fields: Vec<String>,
}

impl JoinStep {
    /// Whether this hop attaches an array of records
    #[must_use]
    pub fn is_to_many(&self) -> bool {
        self.relation.kind.is_to_many()
    }
}

/// A fully resolved select, self-contained for the adapter
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectPlan {
    pub table: String,
    /// Scalar columns to project on the root; empty = keep all
    pub base_fields: Vec<String>,
    pub joins: Vec<JoinStep>,
    pub filter: Option<FilterNode>,
    /// Same-table sort keys, applied before joins
    pub sort: Vec<SortKey>,
    /// Relation-path sort keys, applied after the join stage
    pub relation_sort: Vec<SortKey>,
    pub page: Page,
}

/// How the primary key of a table is produced on insert
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PkGeneration {
    /// Caller must provide the key
    Provided,
    /// Random v4 UUID
    Uuid,
    /// Monotonic per-table sequence
    Sequence,
}

/// Write-side addressing for one table
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteTarget {
    pub table: String,
    pub primary_key: String,
    pub generation: PkGeneration,
}

/// Render a primary-key value as a storage key
#[must_use]
pub fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_condition_operators() {
        let rec = record(json!({"age": 21, "status": "active", "nick": Value::Null}));
        assert!(FilterNode::eq("status", json!("active")).matches(&rec));
        assert!(condition_matches(rec.get("age"), CompareOp::Gt, &json!(18)));
        assert!(!condition_matches(rec.get("age"), CompareOp::Lt, &json!(18)));
        assert!(condition_matches(
            rec.get("age"),
            CompareOp::In,
            &json!([20, 21])
        ));
        assert!(condition_matches(
            rec.get("status"),
            CompareOp::Contains,
            &json!("act")
        ));
        assert!(condition_matches(
            rec.get("nick"),
            CompareOp::IsNull,
            &json!(true)
        ));
        // Missing fields behave as null
        assert!(condition_matches(None, CompareOp::IsNull, &json!(true)));
    }

    #[test]
    fn test_logical_combinators() {
        let rec = record(json!({"age": 21, "status": "active"}));
        let tree = FilterNode::And(vec![
            FilterNode::Cond(FilterCond {
                field: "age".into(),
                op: CompareOp::Gt,
                value: json!(18),
            }),
            FilterNode::eq("status", json!("active")),
        ]);
        assert!(tree.matches(&rec));
        assert!(!FilterNode::Not(Box::new(tree.clone())).matches(&rec));
        let or = FilterNode::Or(vec![FilterNode::eq("status", json!("blocked")), tree]);
        assert!(or.matches(&rec));
    }

    #[test]
    fn test_numeric_cross_type_equality() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(!values_equal(&json!(1), &json!("1")));
    }

    #[test]
    fn test_sort_key_parse() {
        assert_eq!(
            SortKey::parse("-age"),
            SortKey {
                field: "age".into(),
                descending: true
            }
        );
        assert!(!SortKey::parse("name").descending);
        assert!(SortKey::parse("author.name").is_relation_path());
    }

    #[test]
    fn test_sort_records_multi_key() {
        let mut records = vec![
            record(json!({"a": 2, "b": "x"})),
            record(json!({"a": 1, "b": "z"})),
            record(json!({"a": 1, "b": "y"})),
        ];
        sort_records(
            &mut records,
            &[SortKey::parse("a"), SortKey::parse("-b")],
        );
        assert_eq!(records[0]["b"], json!("z"));
        assert_eq!(records[1]["b"], json!("y"));
        assert_eq!(records[2]["a"], json!(2));
    }

    #[test]
    fn test_path_get_nested() {
        let rec = record(json!({"author": {"team": {"name": "core"}}}));
        assert_eq!(path_get(&rec, "author.team.name"), Some(&json!("core")));
        assert_eq!(path_get(&rec, "author.missing"), None);
    }

    #[test]
    fn test_page_apply() {
        let mut records: Vec<Record> = (0..10).map(|i| record(json!({"i": i}))).collect();
        Page {
            limit: Some(3),
            offset: 4,
        }
        .apply(&mut records);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["i"], json!(4));

        let mut records: Vec<Record> = (0..3).map(|i| record(json!({"i": i}))).collect();
        Page {
            limit: None,
            offset: 0,
        }
        .apply(&mut records);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_value_key_rendering() {
        assert_eq!(value_key(&json!("abc")), "abc");
        assert_eq!(value_key(&json!(42)), "42");
    }
}
