pub mod algorithms;
#[cfg(feature = "api")]
pub mod api;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod invariants;
pub mod models;
pub mod operations;
pub mod permissions;
pub mod store;

pub mod prelude {
    pub use crate::algorithms::{link_violations, unlink_plan, without_references};
    #[cfg(feature = "api")]
    pub use crate::api::{Caller, FamilyTreeApp};
    #[cfg(feature = "sqlx")]
    pub use crate::db::{MIGRATOR, PgGraphStore, create_family_tables};
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::invariants::{
        ProposedRelationship, check_no_overlap, intervals_overlap, validate_interval,
    };
    pub use crate::models::{
        Attribute, CreateRelativePayload, CreateTreePayload, Gender, LinkViolation,
        MemberRolePayload, Relationship, RelationshipDatesPayload, RelationshipId, Relative,
        RelativeId, SpouseLink, Tree, TreeId, TreeMember, UpdateRelativePayload,
        UpdateTreePayload, UserId,
    };
    pub use crate::operations::{
        CoordinatorConfig, FamilyOperation, FamilyOperationResult, FamilyTreeOperations,
    };
    pub use crate::permissions::{Role, resolve_role};
    pub use crate::store::{GraphStore, MemoryStore};
}
