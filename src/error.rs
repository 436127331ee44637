use anyhow::anyhow;
use serde::Serialize;

use crate::models::{RelationshipId, RelativeId};

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Unauthenticated,
    InvalidInput,
    InvalidRange,
    OverlappingInterval,
    AmbiguousOpenInterval,
    SelfReference,
    LastAdminViolation,
    PartialWriteFailure,
    StorageTimeout,
    Conflict,
    Database,
}

/// Structured context attached to an error for callers that reconcile or report.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorDetails {
    PartialWrite {
        written: Vec<RelativeId>,
        failed: RelativeId,
    },
    ConflictingRelationship {
        relationship_id: RelationshipId,
    },
    MissingRole {
        required: i32,
        actual: i32,
    },
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub details: Option<ErrorDetails>,
    pub source: anyhow::Error,
}

impl LibError {
    fn new(kind: ErrorKind, code: &'static str, public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind,
            code,
            public,
            details: None,
            source,
        }
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = Some(details);
        self
    }

    pub fn database(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::Database, "database_error", public, source)
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::InvalidInput, "invalid_input", public, source)
    }

    pub fn forbidden(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::PermissionDenied, "permission_denied", public, source)
    }

    pub fn unauthenticated(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::Unauthenticated, "unauthenticated", public, source)
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::NotFound, "not_found", public, source)
    }

    pub fn invalid_range(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::InvalidRange, "invalid_range", public, source)
    }

    pub fn overlapping_interval(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(
            ErrorKind::OverlappingInterval,
            "overlapping_interval",
            public,
            source,
        )
    }

    pub fn ambiguous_open_interval(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(
            ErrorKind::AmbiguousOpenInterval,
            "ambiguous_open_interval",
            public,
            source,
        )
    }

    pub fn self_reference(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::SelfReference, "self_reference", public, source)
    }

    pub fn last_admin(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(
            ErrorKind::LastAdminViolation,
            "last_admin_violation",
            public,
            source,
        )
    }

    pub fn partial_write(written: Vec<RelativeId>, failed: RelativeId, source: LibError) -> Self {
        Self::new(
            ErrorKind::PartialWriteFailure,
            "partial_write_failure",
            "Only part of the change was saved; the remaining records need reconciliation",
            anyhow!(
                "write to relative {} failed after {} write(s) landed: {} ({})",
                failed,
                written.len(),
                source.public,
                source.source
            ),
        )
        .with_details(ErrorDetails::PartialWrite { written, failed })
    }

    pub fn storage_timeout(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::StorageTimeout, "storage_timeout", public, source)
    }

    pub fn conflict(public: &'static str, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::Conflict, "write_conflict", public, source)
    }

    /// Validation failures are raised before any write is issued.
    pub const fn is_validation(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::InvalidInput
                | ErrorKind::InvalidRange
                | ErrorKind::OverlappingInterval
                | ErrorKind::AmbiguousOpenInterval
                | ErrorKind::SelfReference
                | ErrorKind::PermissionDenied
                | ErrorKind::LastAdminViolation
        )
    }
}

impl std::fmt::Display for LibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.public, self.code, self.source)
    }
}

impl std::error::Error for LibError {}

/// Pool exhaustion, socket timeouts and Postgres `query_canceled` (57014, raised by
/// `statement_timeout`).
#[cfg(feature = "sqlx")]
pub fn is_storage_timeout(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Io(io) => io.kind() == std::io::ErrorKind::TimedOut,
        sqlx::Error::Database(db) => db.code().as_deref() == Some("57014"),
        _ => false,
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            value if is_storage_timeout(&value) => {
                Self::storage_timeout("Storage did not respond in time", anyhow!(value))
            }
            sqlx::Error::RowNotFound => Self::not_found("Record not found", anyhow!(value)),
            other => Self::database("Database request failed", anyhow!(other)),
        }
    }
}
