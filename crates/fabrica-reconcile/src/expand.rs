//! Snapshot expansion
//!
//! Pure functions that turn the declared relation set into the full set
//! reconciliation persists: every declared relation plus the derived
//! inverse for each relation naming one, with deterministic foreign-key
//! and junction names agreed between both directions. The input snapshot
//! is never mutated; the expansion is a new list.

use crate::snapshot::SchemaSnapshot;
use fabrica_store::{JunctionNames, RelationKind, naming};

/// One relation of the expanded set, still keyed by table names
#[derive(Clone, Debug, PartialEq)]
pub struct ExpandedRelation {
    pub source_table: String,
    pub property_name: String,
    pub kind: RelationKind,
    pub target_table: String,
    pub inverse_property_name: Option<String>,
    pub is_nullable: bool,
    /// True for inverses this expansion synthesized
    pub is_generated: bool,
    pub foreign_key_column: Option<String>,
    pub junction: Option<JunctionNames>,
}

/// Expand declared relations with their derived inverses.
///
/// Foreign-key and junction names always derive from the declaring
/// relation, so the synthesized inverse mirrors them instead of deriving
/// its own. When both directions are declared (a mutual inverse pair),
/// the direction whose `(source_table, property_name)` sorts first is
/// the naming authority for the pair.
#[must_use]
pub fn expand_relations(snapshot: &SchemaSnapshot) -> Vec<ExpandedRelation> {
    let mut expanded: Vec<ExpandedRelation> = Vec::new();

    // Declared relations first, in table order.
    for table in snapshot.tables() {
        for relation in &table.relations {
            let authority = naming_authority(snapshot, &table.name, relation.property_name.as_str());
            let (foreign_key_column, junction) = derived_names(
                relation.kind,
                &authority.0,
                &authority.1,
                &authority.2,
                &table.name,
            );
            expanded.push(ExpandedRelation {
                source_table: table.name.clone(),
                property_name: relation.property_name.clone(),
                kind: relation.kind,
                target_table: relation.target_table.clone(),
                inverse_property_name: relation.inverse_property_name.clone(),
                is_nullable: relation.is_nullable,
                is_generated: false,
                foreign_key_column,
                junction,
            });
        }
    }

    // Derived inverses for every declared relation naming one, unless
    // the target already declares that property itself.
    let declared: Vec<ExpandedRelation> = expanded.clone();
    for relation in &declared {
        let Some(inverse_name) = &relation.inverse_property_name else {
            continue;
        };
        let already_declared = declared.iter().any(|r| {
            r.source_table == relation.target_table && r.property_name == *inverse_name
        });
        if already_declared {
            continue;
        }
        expanded.push(ExpandedRelation {
            source_table: relation.target_table.clone(),
            property_name: inverse_name.clone(),
            kind: relation.kind.inverse(),
            target_table: relation.source_table.clone(),
            inverse_property_name: Some(relation.property_name.clone()),
            is_nullable: true,
            is_generated: true,
            // The physical names belong to the declaring side; the
            // inverse reuses the foreign key and mirrors the junction.
            foreign_key_column: relation.foreign_key_column.clone(),
            junction: relation.junction.as_ref().map(JunctionNames::mirrored),
        });
    }

    expanded
}

/// Resolve which declaration names the physical artifacts of a relation
/// pair: `(source_table, property_name, target_table)` of the authority.
fn naming_authority(
    snapshot: &SchemaSnapshot,
    source_table: &str,
    property_name: &str,
) -> (String, String, String) {
    let relation = snapshot
        .get(source_table)
        .and_then(|t| t.relations.iter().find(|r| r.property_name == property_name));
    let Some(relation) = relation else {
        return (
            source_table.to_string(),
            property_name.to_string(),
            String::new(),
        );
    };

    // A mutual pair exists when the target declares the inverse property
    // pointing back here. The lexicographically first (table, property)
    // wins so both sides agree.
    let mutual = relation.inverse_property_name.as_ref().and_then(|inverse| {
        snapshot.get(&relation.target_table).and_then(|target| {
            target.relations.iter().find(|r| {
                r.property_name == *inverse
                    && r.target_table == source_table
                    && r.inverse_property_name.as_deref() == Some(property_name)
            })
        })
    });

    if let Some(peer) = mutual {
        // The side holding the foreign key names the physical artifacts;
        // between two equal holders the lexicographically first
        // (table, property) declaration wins, so both sides agree.
        let this_holds = relation.kind.holds_foreign_key();
        let peer_holds = peer.kind.holds_foreign_key();
        let peer_is_authority = match (this_holds, peer_holds) {
            (true, false) => false,
            (false, true) => true,
            _ => {
                (relation.target_table.as_str(), peer.property_name.as_str())
                    < (source_table, property_name)
            }
        };
        if peer_is_authority {
            return (
                relation.target_table.clone(),
                peer.property_name.clone(),
                source_table.to_string(),
            );
        }
    }

    (
        source_table.to_string(),
        property_name.to_string(),
        relation.target_table.clone(),
    )
}

fn derived_names(
    kind: RelationKind,
    authority_source: &str,
    authority_property: &str,
    authority_target: &str,
    this_source: &str,
) -> (Option<String>, Option<JunctionNames>) {
    match kind {
        RelationKind::ManyToOne | RelationKind::OneToOne | RelationKind::OneToMany => {
            (Some(naming::foreign_key_column(authority_property)), None)
        }
        RelationKind::ManyToMany => {
            let junction =
                JunctionNames::derive(authority_source, authority_property, authority_target);
            // The junction is stored source-side first; a relation on the
            // non-authority side sees it mirrored.
            let junction = if this_source == authority_source {
                junction
            } else {
                junction.mirrored()
            };
            (None, Some(junction))
        }
    }
}
