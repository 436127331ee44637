use std::collections::{BTreeSet, HashMap};

use crate::models::{LinkViolation, Relative, RelativeId, RelativeLinks};

/// Worklist for removing a relative from the graph.
///
/// `neighbors` is sorted so writes always go out in ascending id order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkPlan {
    pub target: RelativeId,
    pub neighbors: Vec<RelativeId>,
}

/// Collects every relative that must drop its links to `target`: the ones `target` points at
/// and any `referencing` record that points back, even without a matching entry on `target`.
pub fn unlink_plan(target: &Relative, referencing: &[Relative]) -> UnlinkPlan {
    let mut neighbors = BTreeSet::new();
    neighbors.extend(target.children.iter().copied());
    neighbors.extend(target.parents.iter().copied());
    neighbors.extend(
        target
            .relationships
            .iter()
            .map(|relationship| relationship.spouse_id),
    );
    neighbors.extend(
        referencing
            .iter()
            .filter(|relative| relative.references(target.id))
            .map(|relative| relative.id),
    );
    neighbors.remove(&target.id);

    UnlinkPlan {
        target: target.id,
        neighbors: neighbors.into_iter().collect(),
    }
}

/// Links of `relative` with every reference to `target` removed, or `None` when there is none.
pub fn without_references(relative: &Relative, target: RelativeId) -> Option<RelativeLinks> {
    if !relative.references(target) {
        return None;
    }

    Some(RelativeLinks {
        children: relative
            .children
            .iter()
            .copied()
            .filter(|id| *id != target)
            .collect(),
        parents: relative
            .parents
            .iter()
            .copied()
            .filter(|id| *id != target)
            .collect(),
        relationships: relative
            .relationships
            .iter()
            .copied()
            .filter(|relationship| relationship.spouse_id != target)
            .collect(),
    })
}

/// Reports every dangling or one-sided link among `relatives`.
pub fn link_violations(relatives: &[Relative]) -> Vec<LinkViolation> {
    let lookup: HashMap<RelativeId, &Relative> =
        relatives.iter().map(|relative| (relative.id, relative)).collect();

    let mut violations = Vec::new();
    for relative in relatives {
        for child_id in &relative.children {
            match lookup.get(child_id) {
                None => violations.push(LinkViolation::DanglingReference {
                    relative_id: relative.id,
                    missing_relative_id: *child_id,
                }),
                Some(child) if !child.parents.contains(&relative.id) => {
                    violations.push(LinkViolation::AsymmetricChild {
                        parent_id: relative.id,
                        child_id: *child_id,
                    })
                }
                Some(_) => {}
            }
        }

        for parent_id in &relative.parents {
            match lookup.get(parent_id) {
                None => violations.push(LinkViolation::DanglingReference {
                    relative_id: relative.id,
                    missing_relative_id: *parent_id,
                }),
                Some(parent) if !parent.children.contains(&relative.id) => {
                    violations.push(LinkViolation::AsymmetricParent {
                        child_id: relative.id,
                        parent_id: *parent_id,
                    })
                }
                Some(_) => {}
            }
        }

        for relationship in &relative.relationships {
            let Some(spouse) = lookup.get(&relationship.spouse_id) else {
                violations.push(LinkViolation::DanglingReference {
                    relative_id: relative.id,
                    missing_relative_id: relationship.spouse_id,
                });
                continue;
            };

            match spouse.relationship(relationship.id) {
                None => violations.push(LinkViolation::UnmirroredRelationship {
                    relative_id: relative.id,
                    spouse_id: spouse.id,
                    relationship_id: relationship.id,
                }),
                // Reported once per pair, from the lower id.
                Some(mirror)
                    if relative.id < spouse.id && *mirror != relationship.mirrored(relative.id) =>
                {
                    violations.push(LinkViolation::MismatchedRelationshipDates {
                        relative_id: relative.id,
                        spouse_id: spouse.id,
                        relationship_id: relationship.id,
                    })
                }
                Some(_) => {}
            }
        }
    }

    violations
}
