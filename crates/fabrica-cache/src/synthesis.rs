//! Read-time inverse synthesis
//!
//! Reconciliation persists derived inverses, so a compiled view is
//! normally already complete. This pass covers stores touched outside
//! reconciliation: it takes an immutable compiled view and returns a new
//! one with the missing structural inverses appended. No table in the
//! input is ever edited in place.

use crate::compiled::{CompiledMetadata, CompiledRelation};
use fabrica_store::{JunctionNames, RelationKind, naming};
use tracing::debug;

/// Append a synthesized inverse for every relation naming one that the
/// target table does not already carry.
#[must_use]
pub fn synthesize_inverses(meta: &CompiledMetadata) -> CompiledMetadata {
    let mut missing: Vec<CompiledRelation> = Vec::new();

    for table in meta.tables() {
        for relation in &table.relations {
            let Some(inverse_name) = &relation.inverse_property_name else {
                continue;
            };
            let Some(target) = meta.table(&relation.target_table) else {
                continue;
            };
            if target.relation(inverse_name).is_some() {
                continue;
            }
            debug!(
                table = %target.name,
                property = %inverse_name,
                "synthesizing missing inverse relation"
            );
            missing.push(CompiledRelation {
                property_name: inverse_name.clone(),
                kind: relation.kind.inverse(),
                source_table: relation.target_table.clone(),
                target_table: table.name.clone(),
                inverse_property_name: Some(relation.property_name.clone()),
                is_nullable: true,
                is_generated: true,
                // The physical key was named by the original relation's
                // property; the many side keeps it.
                foreign_key_column: relation
                    .foreign_key_column
                    .clone()
                    .or_else(|| match relation.kind {
                        RelationKind::ManyToMany => None,
                        _ => Some(naming::foreign_key_column(&relation.property_name)),
                    }),
                junction: relation.junction.as_ref().map(JunctionNames::mirrored),
            });
        }
    }

    let mut result = meta.clone();
    for relation in missing {
        let Some(target) = result.table(&relation.source_table) else {
            continue;
        };
        let mut table = target.clone();
        table.relations.push(relation);
        result = result.with_table(table);
    }
    result
}
