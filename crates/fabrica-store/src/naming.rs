//! Deterministic derived names
//!
//! Foreign-key and junction names are pure functions of the declaring
//! relation, so re-running reconciliation (and deriving the inverse
//! direction) always lands on the same physical names.

/// Foreign-key column for a to-one relation property
///
/// The key lives on the many side and is named after the property that
/// declared it: `author` -> `author_id`.
#[must_use]
pub fn foreign_key_column(property_name: &str) -> String {
    format!("{property_name}_id")
}

/// Junction table for a many-to-many relation
///
/// The table pair is ordered lexicographically so the declared relation
/// and its derived inverse agree on the same name regardless of which
/// side declared the relation.
#[must_use]
pub fn junction_table_name(source_table: &str, property_name: &str, target_table: &str) -> String {
    let (first, second) = ordered_pair(source_table, target_table);
    format!("{first}_{second}_{property_name}")
}

/// Junction column referencing one side of a many-to-many
///
/// `source_side` selects the column for `source_table`. A self-relation
/// needs distinct names for the two ends.
#[must_use]
pub fn junction_column(source_table: &str, target_table: &str, source_side: bool) -> String {
    if source_table == target_table {
        if source_side {
            format!("{source_table}_source_id")
        } else {
            format!("{target_table}_target_id")
        }
    } else if source_side {
        format!("{source_table}_id")
    } else {
        format!("{target_table}_id")
    }
}

fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_key_from_property() {
        assert_eq!(foreign_key_column("author"), "author_id");
        assert_eq!(foreign_key_column("parent"), "parent_id");
    }

    #[test]
    fn test_junction_name_repeatable() {
        let a = junction_table_name("post", "tags", "tag");
        let b = junction_table_name("post", "tags", "tag");
        assert_eq!(a, b);
        assert_eq!(a, "post_tag_tags");
    }

    #[test]
    fn test_junction_name_order_normalized() {
        // The table pair is ordered, so the property is the only part
        // that depends on the declaring side.
        assert_eq!(
            junction_table_name("tag", "tags", "post"),
            junction_table_name("post", "tags", "tag"),
        );
    }

    #[test]
    fn test_junction_columns() {
        assert_eq!(junction_column("post", "tag", true), "post_id");
        assert_eq!(junction_column("post", "tag", false), "tag_id");
    }

    #[test]
    fn test_self_junction_columns_distinct() {
        let source = junction_column("person", "person", true);
        let target = junction_column("person", "person", false);
        assert_ne!(source, target);
    }
}
