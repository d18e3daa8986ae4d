//! Filter tree translation
//!
//! Turns the caller's JSON filter tree into the plan-level `FilterNode`.
//! An object without logical combinators flattens to a conjunction of
//! `(field, operator, value)` triples; `_and`/`_or`/`_not` translate
//! recursively preserving their grouping. Malformed trees are rejected
//! here, before any store access.

use fabrica_common::{Error, Result};
use fabrica_store::{CompareOp, FilterCond, FilterNode};
use serde_json::Value;

/// Logical combinator keys
const AND_KEY: &str = "_and";
const OR_KEY: &str = "_or";
const NOT_KEY: &str = "_not";

/// Map an operator key to the plan operator
#[must_use]
pub fn operator_from_key(key: &str) -> Option<CompareOp> {
    match key {
        "_eq" => Some(CompareOp::Eq),
        "_neq" => Some(CompareOp::Neq),
        "_gt" => Some(CompareOp::Gt),
        "_gte" => Some(CompareOp::Gte),
        "_lt" => Some(CompareOp::Lt),
        "_lte" => Some(CompareOp::Lte),
        "_in" => Some(CompareOp::In),
        "_not_in" => Some(CompareOp::NotIn),
        "_contains" => Some(CompareOp::Contains),
        "_is_null" => Some(CompareOp::IsNull),
        _ => None,
    }
}

/// Translate a raw filter tree into a `FilterNode`.
pub fn parse_filter(value: &Value) -> Result<FilterNode> {
    let Some(object) = value.as_object() else {
        return Err(Error::invalid_query("filter must be an object"));
    };
    if object.is_empty() {
        return Err(Error::invalid_query("filter object is empty"));
    }

    let mut nodes = Vec::new();
    for (key, operand) in object {
        match key.as_str() {
            AND_KEY => nodes.push(FilterNode::And(parse_branches(key, operand)?)),
            OR_KEY => nodes.push(FilterNode::Or(parse_branches(key, operand)?)),
            NOT_KEY => nodes.push(FilterNode::Not(Box::new(parse_filter(operand)?))),
            field if field.starts_with('_') => {
                return Err(Error::invalid_query(format!(
                    "unknown logical operator '{field}'"
                )));
            }
            field if field.contains('.') => {
                return Err(Error::invalid_query(format!(
                    "filter field '{field}' must be a root-table column"
                )));
            }
            field => nodes.extend(parse_conditions(field, operand)?),
        }
    }

    // A single-key object stays as-is; multiple keys are an implicit
    // conjunction.
    Ok(if nodes.len() == 1 {
        nodes.into_iter().next().expect("checked length")
    } else {
        FilterNode::And(nodes)
    })
}

fn parse_branches(key: &str, operand: &Value) -> Result<Vec<FilterNode>> {
    let Some(items) = operand.as_array() else {
        return Err(Error::invalid_query(format!("'{key}' expects an array")));
    };
    if items.is_empty() {
        return Err(Error::invalid_query(format!("'{key}' array is empty")));
    }
    items.iter().map(parse_filter).collect()
}

fn parse_conditions(field: &str, operand: &Value) -> Result<Vec<FilterNode>> {
    // A bare value is an implicit equality.
    let Some(ops) = operand.as_object() else {
        return Ok(vec![FilterNode::Cond(FilterCond {
            field: field.to_string(),
            op: CompareOp::Eq,
            value: operand.clone(),
        })]);
    };
    if ops.is_empty() {
        return Err(Error::invalid_query(format!(
            "no operator given for field '{field}'"
        )));
    }

    let mut nodes = Vec::new();
    for (op_key, value) in ops {
        let Some(op) = operator_from_key(op_key) else {
            return Err(Error::invalid_query(format!(
                "unknown operator '{op_key}' on field '{field}'"
            )));
        };
        if matches!(op, CompareOp::In | CompareOp::NotIn) && !value.is_array() {
            return Err(Error::invalid_query(format!(
                "'{op_key}' on field '{field}' expects an array"
            )));
        }
        nodes.push(FilterNode::Cond(FilterCond {
            field: field.to_string(),
            op,
            value: value.clone(),
        }));
    }
    Ok(nodes)
}

/// Every field referenced anywhere in the tree
#[must_use]
pub fn referenced_fields(node: &FilterNode) -> Vec<&str> {
    let mut fields = Vec::new();
    collect_fields(node, &mut fields);
    fields
}

fn collect_fields<'a>(node: &'a FilterNode, out: &mut Vec<&'a str>) {
    match node {
        FilterNode::And(nodes) | FilterNode::Or(nodes) => {
            for n in nodes {
                collect_fields(n, out);
            }
        }
        FilterNode::Not(n) => collect_fields(n, out),
        FilterNode::Cond(cond) => out.push(&cond.field),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_implicit_conjunction_flattens() {
        let node = parse_filter(&json!({
            "age": {"_gt": 18},
            "status": {"_eq": "active"}
        }))
        .unwrap();
        let FilterNode::And(nodes) = node else {
            panic!("expected a conjunction");
        };
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn test_logical_combinators_preserved() {
        let node = parse_filter(&json!({
            "_or": [
                {"status": {"_eq": "active"}},
                {"_and": [{"age": {"_gte": 18}}, {"age": {"_lt": 65}}]}
            ]
        }))
        .unwrap();
        let FilterNode::Or(branches) = node else {
            panic!("expected a disjunction");
        };
        assert_eq!(branches.len(), 2);
        assert!(matches!(branches[1], FilterNode::And(_)));
    }

    #[test]
    fn test_bare_value_is_equality() {
        let node = parse_filter(&json!({"status": "active"})).unwrap();
        let FilterNode::Cond(cond) = node else {
            panic!("expected a condition");
        };
        assert_eq!(cond.op, CompareOp::Eq);
        assert_eq!(cond.value, json!("active"));
    }

    #[test]
    fn test_not_wraps_subtree() {
        let node = parse_filter(&json!({"_not": {"status": {"_eq": "blocked"}}})).unwrap();
        assert!(matches!(node, FilterNode::Not(_)));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let err = parse_filter(&json!({"age": {"_between": [1, 2]}})).unwrap_err();
        assert!(matches!(err, Error::InvalidQuerySpec(_)));
    }

    #[test]
    fn test_in_requires_array() {
        let err = parse_filter(&json!({"age": {"_in": 5}})).unwrap_err();
        assert!(matches!(err, Error::InvalidQuerySpec(_)));
    }

    #[test]
    fn test_dotted_filter_field_rejected() {
        let err = parse_filter(&json!({"author.name": {"_eq": "x"}})).unwrap_err();
        assert!(matches!(err, Error::InvalidQuerySpec(_)));
    }

    #[test]
    fn test_empty_forms_rejected() {
        assert!(parse_filter(&json!({})).is_err());
        assert!(parse_filter(&json!({"_and": []})).is_err());
        assert!(parse_filter(&json!({"age": {}})).is_err());
        assert!(parse_filter(&json!("nope")).is_err());
    }

    #[test]
    fn test_referenced_fields_walks_tree() {
        let node = parse_filter(&json!({
            "_or": [
                {"a": 1},
                {"_not": {"b": {"_is_null": true}}}
            ]
        }))
        .unwrap();
        let mut fields = referenced_fields(&node);
        fields.sort_unstable();
        assert_eq!(fields, vec!["a", "b"]);
    }
}
