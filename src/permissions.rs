use std::fmt;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorDetails, LibError, Result};
use crate::models::{Tree, UserId};

/// Ordered permission level held by a tree member.
///
/// Serialized as its integer value, `-1` (blocked) through `3` (admin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Role {
    Blocked = -1,
    Read = 0,
    Add = 1,
    Edit = 2,
    /// Also the `delete` level; the top of the scale.
    Admin = 3,
}

impl Role {
    pub const DELETE: Role = Role::Admin;

    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Blocked => "blocked",
            Role::Read => "read",
            Role::Add => "add",
            Role::Edit => "edit",
            Role::Admin => "admin",
        }
    }
}

impl TryFrom<i32> for Role {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            -1 => Ok(Role::Blocked),
            0 => Ok(Role::Read),
            1 => Ok(Role::Add),
            2 => Ok(Role::Edit),
            3 => Ok(Role::Admin),
            other => Err(format!("role must be an integer between -1 and 3, got {other}")),
        }
    }
}

impl From<Role> for i32 {
    fn from(value: Role) -> Self {
        value.as_i32()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum role for reading a tree, its relatives and their links.
pub const TREE_READ_ROLE: Role = Role::Read;
/// Minimum role for creating relatives and adding links.
pub const RELATIVE_ADD_ROLE: Role = Role::Add;
/// Minimum role for editing relatives, relationship dates and the tree name.
pub const RELATIVE_EDIT_ROLE: Role = Role::Edit;
/// Minimum role for deleting relatives and removing links.
pub const RELATIVE_DELETE_ROLE: Role = Role::DELETE;
/// Minimum role for membership changes, privacy changes and deleting the tree.
pub const TREE_ADMIN_ROLE: Role = Role::Admin;

/// Effective role of `user_id` on `tree`.
///
/// Non-members fall back to `read` on public trees and `blocked` on private ones.
pub fn resolve_role(tree: &Tree, user_id: UserId) -> Role {
    match tree.member(user_id) {
        Some(member) => member.role,
        None if tree.private => Role::Blocked,
        None => Role::Read,
    }
}

pub fn require_role(tree: &Tree, user_id: UserId, required: Role) -> Result<Role> {
    let role = resolve_role(tree, user_id);
    if role >= required {
        return Ok(role);
    }

    Err(LibError::forbidden(
        "Tree not found, or permission denied",
        anyhow!(
            "user {} has role {} on tree {}, {} required",
            user_id,
            role,
            tree.id,
            required
        ),
    )
    .with_details(ErrorDetails::MissingRole {
        required: required.as_i32(),
        actual: role.as_i32(),
    }))
}
