use std::collections::HashSet;

use anyhow::anyhow;
use chrono::NaiveDate;

use crate::error::{ErrorDetails, LibError, Result};
use crate::models::{Relationship, RelationshipId, RelationshipViolation, Relative, RelativeId};

/// A relationship interval about to be written between `relative_id` and `spouse_id`.
#[derive(Debug, Clone, Copy)]
pub struct ProposedRelationship {
    pub relative_id: RelativeId,
    pub spouse_id: RelativeId,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Set when editing an existing relationship, which is then excluded from comparison.
    pub replacing: Option<RelationshipId>,
}

pub fn validate_interval(start_date: Option<NaiveDate>, end_date: Option<NaiveDate>) -> Result<()> {
    if let (Some(start), Some(end)) = (start_date, end_date) {
        if start > end {
            let violation = RelationshipViolation::InvalidRange {
                start_date: start,
                end_date: end,
            };
            return Err(violation_error(&violation));
        }
    }
    Ok(())
}

pub fn validate_lifespan(birthdate: Option<NaiveDate>, deathdate: Option<NaiveDate>) -> Result<()> {
    if let (Some(birth), Some(death)) = (birthdate, deathdate) {
        if birth > death {
            return Err(LibError::invalid_range(
                "Birthdate cannot be after deathdate",
                anyhow!("birthdate {} is after deathdate {}", birth, death),
            ));
        }
    }
    Ok(())
}

/// Half-open `[start, end)` intersection; a missing bound is unbounded in its direction.
pub fn intervals_overlap(
    a_start: Option<NaiveDate>,
    a_end: Option<NaiveDate>,
    b_start: Option<NaiveDate>,
    b_end: Option<NaiveDate>,
) -> bool {
    starts_before(a_start, b_end) && starts_before(b_start, a_end)
}

fn starts_before(start: Option<NaiveDate>, end: Option<NaiveDate>) -> bool {
    match (start, end) {
        (Some(start), Some(end)) => start < end,
        _ => true,
    }
}

/// Every relationship between `relative` and `spouse`, seen from `relative`.
///
/// Both endpoints' lists are read so a copy missing on one side still participates.
pub fn pair_relationships(relative: &Relative, spouse: &Relative) -> Vec<Relationship> {
    let mut seen = HashSet::new();
    let mut pair = Vec::new();
    for relationship in relative.relationships_with(spouse.id) {
        if seen.insert(relationship.id) {
            pair.push(*relationship);
        }
    }
    for relationship in spouse.relationships_with(relative.id) {
        if seen.insert(relationship.id) {
            pair.push(relationship.mirrored(spouse.id));
        }
    }
    pair
}

pub fn relationship_violations(
    proposed: &ProposedRelationship,
    existing: &[Relationship],
) -> Vec<RelationshipViolation> {
    if proposed.relative_id == proposed.spouse_id {
        return vec![RelationshipViolation::SelfReference {
            relative_id: proposed.relative_id,
        }];
    }

    if let (Some(start), Some(end)) = (proposed.start_date, proposed.end_date) {
        if start > end {
            return vec![RelationshipViolation::InvalidRange {
                start_date: start,
                end_date: end,
            }];
        }
    }

    let others = existing.iter().filter(|relationship| {
        relationship.spouse_id == proposed.spouse_id && Some(relationship.id) != proposed.replacing
    });

    let proposed_open = proposed.start_date.is_none() || proposed.end_date.is_none();
    let mut ambiguous = Vec::new();
    let mut overlapping = Vec::new();
    for relationship in others {
        if proposed_open && relationship.is_open() {
            ambiguous.push(RelationshipViolation::AmbiguousOpenInterval {
                existing_relationship_id: relationship.id,
            });
        }
        if intervals_overlap(
            proposed.start_date,
            proposed.end_date,
            relationship.start_date,
            relationship.end_date,
        ) {
            overlapping.push(RelationshipViolation::OverlappingInterval {
                existing_relationship_id: relationship.id,
            });
        }
    }

    ambiguous.extend(overlapping);
    ambiguous
}

/// Fails when `existing` holds a relationship with `spouse_id` that clashes with the proposed dates.
pub fn check_no_overlap(
    existing: &[Relationship],
    relative_id: RelativeId,
    spouse_id: RelativeId,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> Result<()> {
    ensure_relationship_invariants(
        &ProposedRelationship {
            relative_id,
            spouse_id,
            start_date,
            end_date,
            replacing: None,
        },
        existing,
    )
}

pub fn ensure_relationship_invariants(
    proposed: &ProposedRelationship,
    existing: &[Relationship],
) -> Result<()> {
    let violations = relationship_violations(proposed, existing);
    match violations.first() {
        Some(first) => Err(violation_error(first)),
        None => Ok(()),
    }
}

fn violation_error(violation: &RelationshipViolation) -> LibError {
    let public = violation.public_message();
    let source = anyhow!("relationship validation failed: {:?}", violation);
    let mut err = match violation {
        RelationshipViolation::SelfReference { .. } => LibError::self_reference(public, source),
        RelationshipViolation::InvalidRange { .. } => LibError::invalid_range(public, source),
        RelationshipViolation::AmbiguousOpenInterval {
            existing_relationship_id,
        } => LibError::ambiguous_open_interval(public, source).with_details(
            ErrorDetails::ConflictingRelationship {
                relationship_id: *existing_relationship_id,
            },
        ),
        RelationshipViolation::OverlappingInterval {
            existing_relationship_id,
        } => LibError::overlapping_interval(public, source).with_details(
            ErrorDetails::ConflictingRelationship {
                relationship_id: *existing_relationship_id,
            },
        ),
    };
    err.code = violation.error_code();
    err
}
