use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LibError, Result};
use crate::invariants;
use crate::permissions::Role;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::from_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(
    /// Authenticated caller identity, supplied by the auth layer.
    UserId
);
uuid_id!(TreeId);
uuid_id!(RelativeId);
uuid_id!(
    /// Shared by both mirrored copies of a relationship.
    RelationshipId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
    #[default]
    Undefined,
}

impl Gender {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
            Gender::Undefined => "undefined",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            "other" => Some(Gender::Other),
            "undefined" => Some(Gender::Undefined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeMember {
    pub user_id: UserId,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tree {
    pub id: TreeId,
    pub name: String,
    pub private: bool,
    pub members: Vec<TreeMember>,
    pub revision: i64,
    pub created_at: NaiveDateTime,
}

impl Tree {
    pub fn member(&self, user_id: UserId) -> Option<&TreeMember> {
        self.members.iter().find(|member| member.user_id == user_id)
    }

    pub fn admin_count(&self) -> usize {
        self.members
            .iter()
            .filter(|member| member.role == Role::Admin)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// One mirrored copy of a dated pairing between two relatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub id: RelationshipId,
    pub spouse_id: RelativeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
}

impl Relationship {
    pub const fn is_open(&self) -> bool {
        self.start_date.is_none() || self.end_date.is_none()
    }

    /// The copy stored on the other endpoint.
    pub const fn mirrored(&self, owner: RelativeId) -> Self {
        Self {
            id: self.id,
            spouse_id: owner,
            start_date: self.start_date,
            end_date: self.end_date,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relative {
    pub id: RelativeId,
    pub tree_id: TreeId,
    pub first_name: String,
    pub last_name: String,
    pub gender: Gender,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deathdate: Option<NaiveDate>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<RelativeId>,
    pub parents: Vec<RelativeId>,
    pub relationships: Vec<Relationship>,
    pub revision: i64,
    pub created_at: NaiveDateTime,
}

impl Relative {
    pub fn relationship(&self, relationship_id: RelationshipId) -> Option<&Relationship> {
        self.relationships
            .iter()
            .find(|relationship| relationship.id == relationship_id)
    }

    pub fn relationships_with(
        &self,
        spouse_id: RelativeId,
    ) -> impl Iterator<Item = &Relationship> + '_ {
        self.relationships
            .iter()
            .filter(move |relationship| relationship.spouse_id == spouse_id)
    }

    /// Whether any link on this record points at `other`.
    pub fn references(&self, other: RelativeId) -> bool {
        self.children.contains(&other)
            || self.parents.contains(&other)
            || self
                .relationships
                .iter()
                .any(|relationship| relationship.spouse_id == other)
    }
}

/// A relationship entry together with the spouse it points at.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpouseLink {
    pub relationship: Relationship,
    pub spouse: Relative,
}

/// Mutable link lists of a relative, written together as one conditional update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelativeLinks {
    pub children: Vec<RelativeId>,
    pub parents: Vec<RelativeId>,
    pub relationships: Vec<Relationship>,
}

impl From<&Relative> for RelativeLinks {
    fn from(value: &Relative) -> Self {
        Self {
            children: value.children.clone(),
            parents: value.parents.clone(),
            relationships: value.relationships.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelationshipViolation {
    SelfReference {
        relative_id: RelativeId,
    },
    InvalidRange {
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    AmbiguousOpenInterval {
        existing_relationship_id: RelationshipId,
    },
    OverlappingInterval {
        existing_relationship_id: RelationshipId,
    },
}

impl RelationshipViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            RelationshipViolation::SelfReference { .. } => "relationship_self_reference",
            RelationshipViolation::InvalidRange { .. } => "relationship_invalid_range",
            RelationshipViolation::AmbiguousOpenInterval { .. } => {
                "relationship_ambiguous_open_interval"
            }
            RelationshipViolation::OverlappingInterval { .. } => "relationship_overlap",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            RelationshipViolation::SelfReference { .. } => {
                "A relative cannot have a relationship with themselves"
            }
            RelationshipViolation::InvalidRange { .. } => "Start date cannot be after end date",
            RelationshipViolation::AmbiguousOpenInterval { .. } => {
                "If adding multiple relationships between 2 people, you must specify all start and end dates"
            }
            RelationshipViolation::OverlappingInterval { .. } => {
                "Relationship dates cannot overlap"
            }
        }
    }
}

/// A link that breaks the symmetry invariants of a tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkViolation {
    DanglingReference {
        relative_id: RelativeId,
        missing_relative_id: RelativeId,
    },
    AsymmetricChild {
        parent_id: RelativeId,
        child_id: RelativeId,
    },
    AsymmetricParent {
        child_id: RelativeId,
        parent_id: RelativeId,
    },
    UnmirroredRelationship {
        relative_id: RelativeId,
        spouse_id: RelativeId,
        relationship_id: RelationshipId,
    },
    MismatchedRelationshipDates {
        relative_id: RelativeId,
        spouse_id: RelativeId,
        relationship_id: RelationshipId,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTreePayload {
    pub name: String,
    pub private: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTreePayload {
    pub name: Option<String>,
    pub private: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRolePayload {
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRelativePayload {
    pub first_name: String,
    pub last_name: String,
    pub gender: Option<Gender>,
    pub birthdate: Option<NaiveDate>,
    pub deathdate: Option<NaiveDate>,
    pub attributes: Option<Vec<Attribute>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRelativePayload {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<Gender>,
    pub birthdate: Option<NaiveDate>,
    pub deathdate: Option<NaiveDate>,
    pub attributes: Option<Vec<Attribute>>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDatesPayload {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Validated non-link fields of a relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativeProfile {
    pub first_name: String,
    pub last_name: String,
    pub gender: Gender,
    pub birthdate: Option<NaiveDate>,
    pub deathdate: Option<NaiveDate>,
    pub attributes: Vec<Attribute>,
}

impl CreateTreePayload {
    pub fn normalized_name(&self) -> Result<String> {
        normalize_tree_name(&self.name)
    }
}

impl UpdateTreePayload {
    pub fn normalized_name(&self) -> Result<Option<String>> {
        self.name.as_deref().map(normalize_tree_name).transpose()
    }
}

impl CreateRelativePayload {
    pub fn normalize(self) -> Result<RelativeProfile> {
        let profile = RelativeProfile {
            first_name: required_name(&self.first_name, "First name is required")?,
            last_name: required_name(&self.last_name, "Last name is required")?,
            gender: self.gender.unwrap_or_default(),
            birthdate: self.birthdate,
            deathdate: self.deathdate,
            attributes: normalize_attributes(self.attributes.unwrap_or_default())?,
        };
        invariants::validate_lifespan(profile.birthdate, profile.deathdate)?;
        Ok(profile)
    }
}

impl UpdateRelativePayload {
    /// Overlays the populated fields onto `existing`.
    pub fn apply_to(self, existing: &Relative) -> Result<RelativeProfile> {
        let profile = RelativeProfile {
            first_name: match self.first_name {
                Some(name) => required_name(&name, "First name is required")?,
                None => existing.first_name.clone(),
            },
            last_name: match self.last_name {
                Some(name) => required_name(&name, "Last name is required")?,
                None => existing.last_name.clone(),
            },
            gender: self.gender.unwrap_or(existing.gender),
            birthdate: self.birthdate.or(existing.birthdate),
            deathdate: self.deathdate.or(existing.deathdate),
            attributes: match self.attributes {
                Some(attributes) => normalize_attributes(attributes)?,
                None => existing.attributes.clone(),
            },
        };
        invariants::validate_lifespan(profile.birthdate, profile.deathdate)?;
        Ok(profile)
    }
}

fn normalize_tree_name(name: &str) -> Result<String> {
    required_name(name, "Name is required")
}

fn required_name(value: &str, public: &'static str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LibError::invalid(public, anyhow!("empty name field")));
    }
    Ok(trimmed.to_string())
}

fn normalize_attributes(attributes: Vec<Attribute>) -> Result<Vec<Attribute>> {
    attributes
        .into_iter()
        .map(|attribute| {
            let name = attribute.name.trim().to_string();
            if name.is_empty() {
                return Err(LibError::invalid(
                    "Attribute name is required",
                    anyhow!("attribute with empty name"),
                ));
            }
            Ok(Attribute {
                name,
                value: attribute.value,
            })
        })
        .collect()
}
