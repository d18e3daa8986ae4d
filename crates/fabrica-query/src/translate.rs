//! Field expansion and plan building
//!
//! Resolves a query spec against compiled metadata: dotted field paths
//! become join steps (executed as joins or lookups by the backend),
//! wildcards expand to the non-hidden scalar columns, sort keys are
//! split into same-table and post-join groups, and pagination rules are
//! enforced. The output plan is self-contained.

use crate::filter::{parse_filter, referenced_fields};
use crate::spec::QuerySpec;
use fabrica_cache::{CompiledMetadata, CompiledRelation, CompiledTable};
use fabrica_common::{Error, Result};
use fabrica_store::{JoinRelation, JoinStep, Page, SelectPlan, SortKey};

/// Build a select plan from a query spec.
pub fn build_select_plan(
    meta: &CompiledMetadata,
    spec: &QuerySpec,
    default_limit: u64,
) -> Result<SelectPlan> {
    let table = meta
        .table(&spec.table)
        .ok_or_else(|| Error::TableNotFound(spec.table.clone()))?;

    let mut plan = SelectPlan {
        table: table.name.clone(),
        base_fields: Vec::new(),
        joins: Vec::new(),
        filter: None,
        sort: Vec::new(),
        relation_sort: Vec::new(),
        page: validate_page(spec, default_limit)?,
    };

    expand_fields(meta, table, spec.fields.as_deref(), &mut plan)?;

    if let Some(raw) = &spec.filter {
        let filter = parse_filter(raw)?;
        for field in referenced_fields(&filter) {
            if table.column(field).is_none() {
                return Err(Error::invalid_query(format!(
                    "unknown filter field '{}' on table '{}'",
                    field, table.name
                )));
            }
        }
        plan.filter = Some(filter);
    }

    for raw in spec.sort.as_deref().unwrap_or_default() {
        let key = SortKey::parse(raw);
        if key.is_relation_path() {
            // The joined fields must exist before this key can apply.
            ensure_sort_join(meta, table, &key.field, &mut plan)?;
            plan.relation_sort.push(key);
        } else {
            if table.column(&key.field).is_none() {
                return Err(Error::invalid_query(format!(
                    "unknown sort field '{}' on table '{}'",
                    key.field, table.name
                )));
            }
            plan.sort.push(key);
        }
    }

    // Join steps execute shallow-to-deep so nested paths find their
    // parents already attached.
    plan.joins.sort_by_key(|s| s.path.len());
    Ok(plan)
}

fn validate_page(spec: &QuerySpec, default_limit: u64) -> Result<Page> {
    let limit = match spec.limit {
        None => Some(default_limit).filter(|l| *l > 0),
        Some(0) => None,
        Some(n) if n > 0 => Some(n.unsigned_abs()),
        Some(n) => {
            return Err(Error::invalid_query(format!("negative limit {n}")));
        }
    };
    let page = match spec.page {
        None => 1,
        Some(p) if p >= 1 => p.unsigned_abs(),
        Some(p) => {
            return Err(Error::invalid_query(format!(
                "page numbers start at 1, got {p}"
            )));
        }
    };
    let offset = limit.map_or(0, |l| (page - 1) * l);
    Ok(Page { limit, offset })
}

fn expand_fields(
    meta: &CompiledMetadata,
    table: &CompiledTable,
    fields: Option<&[String]>,
    plan: &mut SelectPlan,
) -> Result<()> {
    let wildcard = fields.is_none_or(|f| f.is_empty() || f.iter().any(|s| s == "*"));
    if wildcard {
        plan.base_fields = table.visible_columns().map(|c| c.name.clone()).collect();
    }
    let Some(fields) = fields else {
        return Ok(());
    };

    for field in fields {
        if field == "*" {
            continue;
        }
        if field.contains('.') {
            expand_path(meta, table, field, plan)?;
        } else if table.column(field).is_some() {
            if !plan.base_fields.iter().any(|f| f == field) {
                plan.base_fields.push(field.clone());
            }
        } else if let Some(relation) = table.relation(field) {
            // A bare relation name selects the whole related record set,
            // projected to its visible scalars.
            let target = meta
                .table(&relation.target_table)
                .ok_or_else(|| Error::TableNotFound(relation.target_table.clone()))?;
            let step_fields: Vec<String> =
                target.visible_columns().map(|c| c.name.clone()).collect();
            upsert_join(meta, plan, vec![field.clone()], relation, step_fields)?;
        } else {
            return Err(Error::invalid_query(format!(
                "unknown field '{}' on table '{}'",
                field, table.name
            )));
        }
    }
    Ok(())
}

/// Resolve one dotted path, creating a join step per relation segment.
fn expand_path(
    meta: &CompiledMetadata,
    root: &CompiledTable,
    path: &str,
    plan: &mut SelectPlan,
) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    let mut walked: Vec<String> = Vec::new();

    for (index, segment) in segments.iter().enumerate() {
        let is_last = index == segments.len() - 1;
        if let Some(relation) = current.relation(segment) {
            walked.push((*segment).to_string());
            let target = meta
                .table(&relation.target_table)
                .ok_or_else(|| Error::TableNotFound(relation.target_table.clone()))?;
            let step_fields = if is_last {
                // Path ends on a relation: project its visible scalars.
                target.visible_columns().map(|c| c.name.clone()).collect()
            } else {
                Vec::new()
            };
            upsert_join(meta, plan, walked.clone(), relation, step_fields)?;
            current = target;
        } else if is_last && current.column(segment).is_some() {
            // Terminal scalar on the joined table.
            add_join_field(plan, &walked, segment);
            return Ok(());
        } else {
            return Err(Error::invalid_query(format!(
                "unknown path segment '{}' in field '{}'",
                segment, path
            )));
        }
    }
    Ok(())
}

fn ensure_sort_join(
    meta: &CompiledMetadata,
    root: &CompiledTable,
    path: &str,
    plan: &mut SelectPlan,
) -> Result<()> {
    // A sort path must resolve exactly like a field path.
    expand_path(meta, root, path, plan)
}

/// Add (or merge into) the join step for a relation path.
fn upsert_join(
    meta: &CompiledMetadata,
    plan: &mut SelectPlan,
    path: Vec<String>,
    relation: &CompiledRelation,
    fields: Vec<String>,
) -> Result<()> {
    if let Some(step) = plan.joins.iter_mut().find(|s| s.path == path) {
        for field in fields {
            if !step.fields.iter().any(|f| *f == field) {
                step.fields.push(field);
            }
        }
        return Ok(());
    }
    plan.joins.push(JoinStep {
        path,
        relation: join_relation(meta, relation)?,
        fields,
    });
    Ok(())
}

fn add_join_field(plan: &mut SelectPlan, path: &[String], field: &str) {
    if let Some(step) = plan.joins.iter_mut().find(|s| s.path == path) {
        if !step.fields.iter().any(|f| f == field) {
            step.fields.push(field.to_string());
        }
    }
}

/// Everything the backend needs to execute one relation hop.
pub(crate) fn join_relation(
    meta: &CompiledMetadata,
    relation: &CompiledRelation,
) -> Result<JoinRelation> {
    let source_pk = primary_key_name(meta, &relation.source_table)?;
    let target_pk = primary_key_name(meta, &relation.target_table)?;
    Ok(JoinRelation {
        kind: relation.kind,
        source_table: relation.source_table.clone(),
        target_table: relation.target_table.clone(),
        property: relation.property_name.clone(),
        source_pk,
        target_pk,
        foreign_key: relation.foreign_key_column.clone(),
        foreign_key_on_target: relation.foreign_key_on_target(),
        junction: relation.junction.clone(),
    })
}

fn primary_key_name(meta: &CompiledMetadata, table: &str) -> Result<String> {
    Ok(meta
        .table(table)
        .ok_or_else(|| Error::TableNotFound(table.to_string()))?
        .primary_key()
        .map_or_else(|| "id".to_string(), |pk| pk.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabrica_common::RelationId;
    use fabrica_store::{
        ColumnDefinition, DataType, RelationDefinition, RelationKind, StoredDefinitions,
        TableDefinition,
    };

    fn blog_metadata() -> CompiledMetadata {
        let post = TableDefinition::new("post");
        let user = TableDefinition::new("user");
        let mut defs = StoredDefinitions::default();

        let mut pk = ColumnDefinition::new(post.id, "id", DataType::Int);
        pk.is_primary = true;
        defs.columns.push(pk);
        defs.columns
            .push(ColumnDefinition::new(post.id, "title", DataType::Varchar));
        let mut secret = ColumnDefinition::new(post.id, "draft_notes", DataType::Text);
        secret.is_hidden = true;
        defs.columns.push(secret);

        let mut upk = ColumnDefinition::new(user.id, "id", DataType::Int);
        upk.is_primary = true;
        defs.columns.push(upk);
        defs.columns
            .push(ColumnDefinition::new(user.id, "name", DataType::Varchar));

        defs.relations.push(RelationDefinition {
            id: RelationId::new(),
            source_table_id: post.id,
            property_name: "author".into(),
            kind: RelationKind::ManyToOne,
            target_table_id: user.id,
            inverse_property_name: Some("posts".into()),
            is_nullable: true,
            is_system: false,
            is_generated: false,
            foreign_key_column: Some("author_id".into()),
            junction: None,
        });
        defs.tables.push(post);
        defs.tables.push(user);
        let compiled = fabrica_cache::compile(&defs, 1);
        fabrica_cache::synthesize_inverses(&compiled)
    }

    #[test]
    fn test_wildcard_skips_hidden_columns() {
        let meta = blog_metadata();
        let plan = build_select_plan(&meta, &QuerySpec::table("post"), 100).unwrap();
        assert!(plan.base_fields.iter().any(|f| f == "title"));
        assert!(!plan.base_fields.iter().any(|f| f == "draft_notes"));
    }

    #[test]
    fn test_hidden_column_reachable_by_name() {
        let meta = blog_metadata();
        let spec = QuerySpec::table("post").fields(["draft_notes"]);
        let plan = build_select_plan(&meta, &spec, 100).unwrap();
        assert_eq!(plan.base_fields, vec!["draft_notes".to_string()]);
    }

    #[test]
    fn test_dot_path_builds_join() {
        let meta = blog_metadata();
        let spec = QuerySpec::table("post").fields(["title", "author.name"]);
        let plan = build_select_plan(&meta, &spec, 100).unwrap();
        assert_eq!(plan.joins.len(), 1);
        let step = &plan.joins[0];
        assert_eq!(step.path, vec!["author".to_string()]);
        assert_eq!(step.fields, vec!["name".to_string()]);
        assert_eq!(step.relation.foreign_key.as_deref(), Some("author_id"));
        assert!(!step.relation.foreign_key_on_target);
    }

    #[test]
    fn test_relation_sort_split() {
        let meta = blog_metadata();
        let spec = QuerySpec::table("post").sort(["-title", "author.name"]);
        let plan = build_select_plan(&meta, &spec, 100).unwrap();
        assert_eq!(plan.sort.len(), 1);
        assert_eq!(plan.relation_sort.len(), 1);
        // The sort-only path still got its join step.
        assert_eq!(plan.joins.len(), 1);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let meta = blog_metadata();
        let spec = QuerySpec::table("post").fields(["nope"]);
        assert!(matches!(
            build_select_plan(&meta, &spec, 100),
            Err(Error::InvalidQuerySpec(_))
        ));
    }

    #[test]
    fn test_pagination_rules() {
        let meta = blog_metadata();
        // limit 0 = unbounded
        let plan = build_select_plan(&meta, &QuerySpec::table("post").limit(0), 100).unwrap();
        assert!(plan.page.limit.is_none());
        // absent limit applies the default
        let plan = build_select_plan(&meta, &QuerySpec::table("post"), 25).unwrap();
        assert_eq!(plan.page.limit, Some(25));
        // offset follows the page number
        let plan =
            build_select_plan(&meta, &QuerySpec::table("post").page(3).limit(10), 100).unwrap();
        assert_eq!(plan.page.offset, 20);
        // zero/negative pages are rejected
        assert!(build_select_plan(&meta, &QuerySpec::table("post").page(0), 100).is_err());
        assert!(build_select_plan(&meta, &QuerySpec::table("post").page(-1), 100).is_err());
        assert!(build_select_plan(&meta, &QuerySpec::table("post").limit(-5), 100).is_err());
    }

    #[test]
    fn test_unknown_table_rejected() {
        let meta = blog_metadata();
        assert!(matches!(
            build_select_plan(&meta, &QuerySpec::table("ghost"), 100),
            Err(Error::TableNotFound(_))
        ));
    }
}
