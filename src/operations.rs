use std::env;
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::algorithms;
use crate::error::{ErrorKind, LibError, Result};
use crate::invariants::{self, ProposedRelationship};
use crate::models::{
    CreateRelativePayload, CreateTreePayload, LinkViolation, Relationship,
    RelationshipDatesPayload, RelationshipId, Relative, RelativeId, RelativeLinks, SpouseLink,
    Tree, TreeId, TreeMember, UpdateRelativePayload, UpdateTreePayload, UserId,
};
use crate::permissions::{self, Role};
use crate::store::{GraphStore, RelativeFilter, RelativePatch, StoreWrite, TreeFilter, TreePatch};

pub const MAX_CONFLICT_RETRIES_ENV: &str = "FAMILY_GRAPH_MAX_CONFLICT_RETRIES";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Times an operation is re-read and re-validated after losing a write race.
    pub max_conflict_retries: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var(MAX_CONFLICT_RETRIES_ENV) {
            match raw.trim().parse() {
                Ok(value) => config.max_conflict_retries = value,
                Err(err) => tracing::warn!(
                    value = %raw,
                    error = %err,
                    "ignoring invalid {}",
                    MAX_CONFLICT_RETRIES_ENV
                ),
            }
        }
        config
    }
}

/// Tagged family tree actions for callers that dispatch on data rather than method calls.
///
/// Callers must provide a trusted `actor` sourced from validated auth/session state,
/// not from request arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum FamilyOperation {
    CreateTree {
        payload: CreateTreePayload,
    },
    ListTrees,
    GetTree {
        tree_id: TreeId,
    },
    UpdateTree {
        tree_id: TreeId,
        payload: UpdateTreePayload,
    },
    DeleteTree {
        tree_id: TreeId,
    },
    ListMembers {
        tree_id: TreeId,
    },
    AddMember {
        tree_id: TreeId,
        user_id: UserId,
        role: Role,
    },
    SetMemberRole {
        tree_id: TreeId,
        user_id: UserId,
        role: Role,
    },
    RemoveMember {
        tree_id: TreeId,
        user_id: UserId,
    },
    CreateRelative {
        tree_id: TreeId,
        payload: CreateRelativePayload,
    },
    GetRelative {
        tree_id: TreeId,
        relative_id: RelativeId,
    },
    ListRelatives {
        tree_id: TreeId,
    },
    UpdateRelative {
        tree_id: TreeId,
        relative_id: RelativeId,
        payload: UpdateRelativePayload,
    },
    GetChildren {
        tree_id: TreeId,
        relative_id: RelativeId,
    },
    GetParents {
        tree_id: TreeId,
        relative_id: RelativeId,
    },
    GetRelationships {
        tree_id: TreeId,
        relative_id: RelativeId,
    },
    DeleteRelative {
        tree_id: TreeId,
        relative_id: RelativeId,
    },
    AddChild {
        tree_id: TreeId,
        parent_id: RelativeId,
        child_id: RelativeId,
    },
    RemoveChild {
        tree_id: TreeId,
        parent_id: RelativeId,
        child_id: RelativeId,
    },
    AddRelationship {
        tree_id: TreeId,
        relative_id: RelativeId,
        spouse_id: RelativeId,
        #[serde(default)]
        dates: RelationshipDatesPayload,
    },
    UpdateRelationship {
        tree_id: TreeId,
        relative_id: RelativeId,
        relationship_id: RelationshipId,
        #[serde(default)]
        dates: RelationshipDatesPayload,
    },
    RemoveRelationship {
        tree_id: TreeId,
        relative_id: RelativeId,
        relationship_id: RelationshipId,
    },
    AuditTree {
        tree_id: TreeId,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FamilyOperationResult {
    Tree { tree: Tree },
    Trees { items: Vec<Tree> },
    Members { members: Vec<TreeMember> },
    Relative { relative: Relative },
    Relatives { items: Vec<Relative> },
    Relationship { relationship: Relationship },
    Links { links: Vec<SpouseLink> },
    Violations { violations: Vec<LinkViolation> },
    Deleted,
    Unlinked,
}

/// Coordinates role checks, validation and mirrored writes against a [`GraphStore`].
pub struct FamilyTreeOperations<S> {
    store: Arc<S>,
    config: CoordinatorConfig,
}

impl<S> Clone for FamilyTreeOperations<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config,
        }
    }
}

impl<S: GraphStore> FamilyTreeOperations<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, CoordinatorConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub async fn execute(
        &self,
        actor: UserId,
        operation: FamilyOperation,
    ) -> Result<FamilyOperationResult> {
        match operation {
            FamilyOperation::CreateTree { payload } => {
                let tree = self.create_tree(actor, payload).await?;
                Ok(FamilyOperationResult::Tree { tree })
            }
            FamilyOperation::ListTrees => {
                let items = self.list_trees(actor).await?;
                Ok(FamilyOperationResult::Trees { items })
            }
            FamilyOperation::GetTree { tree_id } => {
                let tree = self.get_tree(actor, tree_id).await?;
                Ok(FamilyOperationResult::Tree { tree })
            }
            FamilyOperation::UpdateTree { tree_id, payload } => {
                let tree = self.update_tree(actor, tree_id, payload).await?;
                Ok(FamilyOperationResult::Tree { tree })
            }
            FamilyOperation::DeleteTree { tree_id } => {
                self.delete_tree(actor, tree_id).await?;
                Ok(FamilyOperationResult::Deleted)
            }
            FamilyOperation::ListMembers { tree_id } => {
                let members = self.list_members(actor, tree_id).await?;
                Ok(FamilyOperationResult::Members { members })
            }
            FamilyOperation::AddMember {
                tree_id,
                user_id,
                role,
            } => {
                let members = self.add_member(actor, tree_id, user_id, role).await?;
                Ok(FamilyOperationResult::Members { members })
            }
            FamilyOperation::SetMemberRole {
                tree_id,
                user_id,
                role,
            } => {
                let members = self
                    .update_tree_membership(actor, tree_id, user_id, role)
                    .await?;
                Ok(FamilyOperationResult::Members { members })
            }
            FamilyOperation::RemoveMember { tree_id, user_id } => {
                let members = self.remove_member(actor, tree_id, user_id).await?;
                Ok(FamilyOperationResult::Members { members })
            }
            FamilyOperation::CreateRelative { tree_id, payload } => {
                let relative = self.create_relative(actor, tree_id, payload).await?;
                Ok(FamilyOperationResult::Relative { relative })
            }
            FamilyOperation::GetRelative {
                tree_id,
                relative_id,
            } => {
                let relative = self.get_relative(actor, tree_id, relative_id).await?;
                Ok(FamilyOperationResult::Relative { relative })
            }
            FamilyOperation::ListRelatives { tree_id } => {
                let items = self.list_relatives(actor, tree_id).await?;
                Ok(FamilyOperationResult::Relatives { items })
            }
            FamilyOperation::UpdateRelative {
                tree_id,
                relative_id,
                payload,
            } => {
                let relative = self
                    .update_relative(actor, tree_id, relative_id, payload)
                    .await?;
                Ok(FamilyOperationResult::Relative { relative })
            }
            FamilyOperation::GetChildren {
                tree_id,
                relative_id,
            } => {
                let items = self.get_children(actor, tree_id, relative_id).await?;
                Ok(FamilyOperationResult::Relatives { items })
            }
            FamilyOperation::GetParents {
                tree_id,
                relative_id,
            } => {
                let items = self.get_parents(actor, tree_id, relative_id).await?;
                Ok(FamilyOperationResult::Relatives { items })
            }
            FamilyOperation::GetRelationships {
                tree_id,
                relative_id,
            } => {
                let links = self.get_relationships(actor, tree_id, relative_id).await?;
                Ok(FamilyOperationResult::Links { links })
            }
            FamilyOperation::DeleteRelative {
                tree_id,
                relative_id,
            } => {
                self.delete_relative(actor, tree_id, relative_id).await?;
                Ok(FamilyOperationResult::Deleted)
            }
            FamilyOperation::AddChild {
                tree_id,
                parent_id,
                child_id,
            } => {
                let relative = self.add_child(actor, tree_id, parent_id, child_id).await?;
                Ok(FamilyOperationResult::Relative { relative })
            }
            FamilyOperation::RemoveChild {
                tree_id,
                parent_id,
                child_id,
            } => {
                self.remove_child(actor, tree_id, parent_id, child_id)
                    .await?;
                Ok(FamilyOperationResult::Unlinked)
            }
            FamilyOperation::AddRelationship {
                tree_id,
                relative_id,
                spouse_id,
                dates,
            } => {
                let relationship = self
                    .add_relationship(actor, tree_id, relative_id, spouse_id, dates)
                    .await?;
                Ok(FamilyOperationResult::Relationship { relationship })
            }
            FamilyOperation::RemoveRelationship {
                tree_id,
                relative_id,
                relationship_id,
            } => {
                self.remove_relationship(actor, tree_id, relative_id, relationship_id)
                    .await?;
                Ok(FamilyOperationResult::Unlinked)
            }
            FamilyOperation::UpdateRelationship {
                tree_id,
                relative_id,
                relationship_id,
                dates,
            } => {
                let relationship = self
                    .update_relationship(actor, tree_id, relative_id, relationship_id, dates)
                    .await?;
                Ok(FamilyOperationResult::Relationship { relationship })
            }
            FamilyOperation::AuditTree { tree_id } => {
                let violations = self.audit_tree(actor, tree_id).await?;
                Ok(FamilyOperationResult::Violations { violations })
            }
        }
    }

    // Trees

    pub async fn create_tree(&self, actor: UserId, payload: CreateTreePayload) -> Result<Tree> {
        let name = payload.normalized_name()?;
        let tree = Tree {
            id: TreeId::new_v4(),
            name,
            private: payload.private.unwrap_or(true),
            members: vec![TreeMember {
                user_id: actor,
                role: Role::Admin,
            }],
            revision: 1,
            created_at: Utc::now().naive_utc(),
        };
        let tree = self.store.insert_tree(tree).await?;
        tracing::info!(tree_id = %tree.id, owner = %actor, "created tree");
        Ok(tree)
    }

    pub async fn get_tree(&self, actor: UserId, tree_id: TreeId) -> Result<Tree> {
        let (tree, _) = self
            .authorize(actor, tree_id, permissions::TREE_READ_ROLE)
            .await?;
        Ok(tree)
    }

    /// Trees listing `actor` as a member with at least read access.
    pub async fn list_trees(&self, actor: UserId) -> Result<Vec<Tree>> {
        let trees = self
            .store
            .find_trees(TreeFilter {
                member: Some(actor),
            })
            .await?;
        Ok(trees
            .into_iter()
            .filter(|tree| permissions::resolve_role(tree, actor) >= permissions::TREE_READ_ROLE)
            .collect())
    }

    pub async fn update_tree(
        &self,
        actor: UserId,
        tree_id: TreeId,
        payload: UpdateTreePayload,
    ) -> Result<Tree> {
        let name = payload.normalized_name()?;
        self.retry_on_conflict("update_tree", move || {
            self.try_update_tree(actor, tree_id, name.clone(), payload.private)
        })
        .await
    }

    async fn try_update_tree(
        &self,
        actor: UserId,
        tree_id: TreeId,
        name: Option<String>,
        private: Option<bool>,
    ) -> Result<Tree> {
        let (tree, role) = self
            .authorize(actor, tree_id, permissions::RELATIVE_EDIT_ROLE)
            .await?;
        if private.is_some() && role < permissions::TREE_ADMIN_ROLE {
            return Err(LibError::forbidden(
                "Only tree admins can change tree privacy",
                anyhow!("user {} with role {} changed privacy of {}", actor, role, tree_id),
            ));
        }

        self.store
            .update_tree(
                tree_id,
                TreePatch {
                    name,
                    private,
                    members: None,
                },
                Some(tree.revision),
            )
            .await
    }

    /// Deletes every relative of the tree, then the tree itself.
    ///
    /// Re-running after a failure finishes the job, since the tree record goes last.
    pub async fn delete_tree(&self, actor: UserId, tree_id: TreeId) -> Result<()> {
        self.authorize(actor, tree_id, permissions::TREE_ADMIN_ROLE)
            .await?;

        let relatives = self
            .store
            .find_relatives(RelativeFilter::tree(tree_id))
            .await?;
        let mut deleted = Vec::with_capacity(relatives.len());
        for relative in relatives {
            match self.store.delete_relative(relative.id, None).await {
                Ok(()) => deleted.push(relative.id),
                Err(err) if err.kind == ErrorKind::NotFound => {}
                Err(err) if deleted.is_empty() => return Err(err),
                Err(err) => {
                    tracing::warn!(tree_id = %tree_id, relative_id = %relative.id, error = %err, "tree delete stopped partway");
                    return Err(LibError::partial_write(deleted, relative.id, err));
                }
            }
        }

        self.store.delete_tree(tree_id).await?;
        tracing::info!(tree_id = %tree_id, relatives = deleted.len(), "deleted tree");
        Ok(())
    }

    // Membership

    pub async fn list_members(&self, actor: UserId, tree_id: TreeId) -> Result<Vec<TreeMember>> {
        let (tree, _) = self
            .authorize(actor, tree_id, permissions::TREE_READ_ROLE)
            .await?;
        Ok(tree.members)
    }

    pub async fn add_member(
        &self,
        actor: UserId,
        tree_id: TreeId,
        user_id: UserId,
        role: Role,
    ) -> Result<Vec<TreeMember>> {
        self.retry_on_conflict("add_member", move || {
            self.try_add_member(actor, tree_id, user_id, role)
        })
        .await
    }

    async fn try_add_member(
        &self,
        actor: UserId,
        tree_id: TreeId,
        user_id: UserId,
        role: Role,
    ) -> Result<Vec<TreeMember>> {
        let (tree, acting_role) = self
            .authorize(actor, tree_id, permissions::TREE_ADMIN_ROLE)
            .await?;
        let members = added_membership(&tree, user_id, role, acting_role)?;
        self.write_members(&tree, members).await
    }

    /// Changes `user_id`'s role, guarded by the membership snapshot the decision was made on.
    pub async fn update_tree_membership(
        &self,
        actor: UserId,
        tree_id: TreeId,
        user_id: UserId,
        role: Role,
    ) -> Result<Vec<TreeMember>> {
        self.retry_on_conflict("update_tree_membership", move || {
            self.try_update_tree_membership(actor, tree_id, user_id, role)
        })
        .await
    }

    async fn try_update_tree_membership(
        &self,
        actor: UserId,
        tree_id: TreeId,
        user_id: UserId,
        role: Role,
    ) -> Result<Vec<TreeMember>> {
        let tree = self.store.get_tree(tree_id).await?;
        let acting_role = permissions::resolve_role(&tree, actor);
        let members = updated_membership(&tree, user_id, role, acting_role)?;
        self.write_members(&tree, members).await
    }

    pub async fn remove_member(
        &self,
        actor: UserId,
        tree_id: TreeId,
        user_id: UserId,
    ) -> Result<Vec<TreeMember>> {
        self.retry_on_conflict("remove_member", move || {
            self.try_remove_member(actor, tree_id, user_id)
        })
        .await
    }

    async fn try_remove_member(
        &self,
        actor: UserId,
        tree_id: TreeId,
        user_id: UserId,
    ) -> Result<Vec<TreeMember>> {
        let (tree, acting_role) = self
            .authorize(actor, tree_id, permissions::TREE_ADMIN_ROLE)
            .await?;
        let members = removed_membership(&tree, user_id, acting_role)?;
        self.write_members(&tree, members).await
    }

    async fn write_members(&self, tree: &Tree, members: Vec<TreeMember>) -> Result<Vec<TreeMember>> {
        let updated = self
            .store
            .update_tree(
                tree.id,
                TreePatch {
                    members: Some(members),
                    ..TreePatch::default()
                },
                Some(tree.revision),
            )
            .await?;
        tracing::debug!(tree_id = %tree.id, revision = updated.revision, "updated tree members");
        Ok(updated.members)
    }

    // Relatives

    pub async fn create_relative(
        &self,
        actor: UserId,
        tree_id: TreeId,
        payload: CreateRelativePayload,
    ) -> Result<Relative> {
        self.authorize(actor, tree_id, permissions::RELATIVE_ADD_ROLE)
            .await?;
        let profile = payload.normalize()?;
        let relative = Relative {
            id: RelativeId::new_v4(),
            tree_id,
            first_name: profile.first_name,
            last_name: profile.last_name,
            gender: profile.gender,
            birthdate: profile.birthdate,
            deathdate: profile.deathdate,
            attributes: profile.attributes,
            children: vec![],
            parents: vec![],
            relationships: vec![],
            revision: 1,
            created_at: Utc::now().naive_utc(),
        };
        self.store.insert_relative(relative).await
    }

    pub async fn get_relative(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
    ) -> Result<Relative> {
        self.authorize(actor, tree_id, permissions::TREE_READ_ROLE)
            .await?;
        self.load_relative(tree_id, relative_id).await
    }

    pub async fn list_relatives(&self, actor: UserId, tree_id: TreeId) -> Result<Vec<Relative>> {
        self.authorize(actor, tree_id, permissions::TREE_READ_ROLE)
            .await?;
        self.store
            .find_relatives(RelativeFilter::tree(tree_id))
            .await
    }

    /// Updates profile fields only; links change through the dedicated link operations.
    pub async fn update_relative(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
        payload: UpdateRelativePayload,
    ) -> Result<Relative> {
        self.retry_on_conflict("update_relative", move || {
            self.try_update_relative(actor, tree_id, relative_id, payload.clone())
        })
        .await
    }

    async fn try_update_relative(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
        payload: UpdateRelativePayload,
    ) -> Result<Relative> {
        self.authorize(actor, tree_id, permissions::RELATIVE_EDIT_ROLE)
            .await?;
        let existing = self.load_relative(tree_id, relative_id).await?;
        let profile = payload.apply_to(&existing)?;
        self.store
            .update_relative(
                relative_id,
                RelativePatch::Profile(profile),
                Some(existing.revision),
            )
            .await
    }

    pub async fn get_children(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
    ) -> Result<Vec<Relative>> {
        let relative = self.get_relative(actor, tree_id, relative_id).await?;
        self.hydrate(tree_id, &relative.children).await
    }

    pub async fn get_parents(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
    ) -> Result<Vec<Relative>> {
        let relative = self.get_relative(actor, tree_id, relative_id).await?;
        self.hydrate(tree_id, &relative.parents).await
    }

    pub async fn get_relationships(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
    ) -> Result<Vec<SpouseLink>> {
        let relative = self.get_relative(actor, tree_id, relative_id).await?;
        let mut links = Vec::with_capacity(relative.relationships.len());
        for relationship in relative.relationships {
            if let Some(spouse) = self.load_optional(tree_id, relationship.spouse_id).await? {
                links.push(SpouseLink {
                    relationship,
                    spouse,
                });
            }
        }
        Ok(links)
    }

    /// Removes the relative after unlinking it from every record that references it.
    pub async fn delete_relative(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
    ) -> Result<()> {
        self.retry_on_conflict("delete_relative", move || {
            self.try_delete_relative(actor, tree_id, relative_id)
        })
        .await
    }

    async fn try_delete_relative(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
    ) -> Result<()> {
        let (tree, _) = self
            .authorize(actor, tree_id, permissions::RELATIVE_DELETE_ROLE)
            .await?;
        let target = self.load_relative(tree_id, relative_id).await?;
        let referencing = self
            .store
            .find_relatives(RelativeFilter {
                tree_id: Some(tree_id),
                references: Some(relative_id),
            })
            .await?;
        let plan = algorithms::unlink_plan(&target, &referencing);

        let mut writes = Vec::with_capacity(plan.neighbors.len() + 1);
        for neighbor_id in plan.neighbors {
            // Neighbors outside the tree are never rewritten.
            let neighbor = match referencing.iter().find(|relative| relative.id == neighbor_id) {
                Some(neighbor) => neighbor.clone(),
                None => match self.load_optional(tree_id, neighbor_id).await? {
                    Some(neighbor) => neighbor,
                    None => continue,
                },
            };
            if let Some(links) = algorithms::without_references(&neighbor, relative_id) {
                writes.push(link_write(&neighbor, links));
            }
        }
        writes.push(StoreWrite::DeleteRelative {
            relative_id,
            expected_revision: target.revision,
        });

        self.apply_writes(&tree, writes).await?;
        tracing::info!(tree_id = %tree_id, relative_id = %relative_id, "deleted relative");
        Ok(())
    }

    // Parent/child links

    /// Links `child_id` under `parent_id` on both records and returns the updated parent.
    pub async fn add_child(
        &self,
        actor: UserId,
        tree_id: TreeId,
        parent_id: RelativeId,
        child_id: RelativeId,
    ) -> Result<Relative> {
        self.retry_on_conflict("add_child", move || {
            self.try_add_child(actor, tree_id, parent_id, child_id)
        })
        .await
    }

    async fn try_add_child(
        &self,
        actor: UserId,
        tree_id: TreeId,
        parent_id: RelativeId,
        child_id: RelativeId,
    ) -> Result<Relative> {
        let (tree, _) = self
            .authorize(actor, tree_id, permissions::RELATIVE_ADD_ROLE)
            .await?;
        if parent_id == child_id {
            return Err(LibError::self_reference(
                "A relative cannot be their own parent",
                anyhow!("relative {} linked as its own child", parent_id),
            ));
        }
        let parent = self.load_relative(tree_id, parent_id).await?;
        let child = self.load_relative(tree_id, child_id).await?;

        let mut writes = Vec::with_capacity(2);
        let mut updated = parent.clone();
        if !parent.children.contains(&child_id) {
            let mut links = RelativeLinks::from(&parent);
            links.children.push(child_id);
            updated.children = links.children.clone();
            updated.revision += 1;
            writes.push(link_write(&parent, links));
        }
        if !child.parents.contains(&parent_id) {
            let mut links = RelativeLinks::from(&child);
            links.parents.push(parent_id);
            writes.push(link_write(&child, links));
        }
        if writes.is_empty() {
            return Ok(parent);
        }

        // A concurrent edit may land after the batch; return what this call wrote.
        self.apply_writes(&tree, writes).await?;
        Ok(updated)
    }

    /// Removes the link from both sides. Succeeds when the link is already gone.
    pub async fn remove_child(
        &self,
        actor: UserId,
        tree_id: TreeId,
        parent_id: RelativeId,
        child_id: RelativeId,
    ) -> Result<()> {
        self.retry_on_conflict("remove_child", move || {
            self.try_remove_child(actor, tree_id, parent_id, child_id)
        })
        .await
    }

    async fn try_remove_child(
        &self,
        actor: UserId,
        tree_id: TreeId,
        parent_id: RelativeId,
        child_id: RelativeId,
    ) -> Result<()> {
        let (tree, _) = self
            .authorize(actor, tree_id, permissions::RELATIVE_DELETE_ROLE)
            .await?;
        let parent = self.load_relative(tree_id, parent_id).await?;
        let child = self.load_optional(tree_id, child_id).await?;

        let mut writes = Vec::with_capacity(2);
        if parent.children.contains(&child_id) {
            let mut links = RelativeLinks::from(&parent);
            links.children.retain(|id| *id != child_id);
            writes.push(link_write(&parent, links));
        }
        if let Some(child) = child.filter(|child| child.parents.contains(&parent_id)) {
            let mut links = RelativeLinks::from(&child);
            links.parents.retain(|id| *id != parent_id);
            writes.push(link_write(&child, links));
        }
        if writes.is_empty() {
            return Ok(());
        }

        self.apply_writes(&tree, writes).await
    }

    // Relationships

    /// Records a dated relationship on both relatives under one shared id.
    pub async fn add_relationship(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
        spouse_id: RelativeId,
        dates: RelationshipDatesPayload,
    ) -> Result<Relationship> {
        self.retry_on_conflict("add_relationship", move || {
            self.try_add_relationship(actor, tree_id, relative_id, spouse_id, dates)
        })
        .await
    }

    async fn try_add_relationship(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
        spouse_id: RelativeId,
        dates: RelationshipDatesPayload,
    ) -> Result<Relationship> {
        let (tree, _) = self
            .authorize(actor, tree_id, permissions::RELATIVE_ADD_ROLE)
            .await?;
        let proposed = ProposedRelationship {
            relative_id,
            spouse_id,
            start_date: dates.start_date,
            end_date: dates.end_date,
            replacing: None,
        };
        invariants::ensure_relationship_invariants(&proposed, &[])?;

        let relative = self.load_relative(tree_id, relative_id).await?;
        let spouse = self.load_relative(tree_id, spouse_id).await?;
        let pair = invariants::pair_relationships(&relative, &spouse);
        invariants::ensure_relationship_invariants(&proposed, &pair)?;

        let relationship = Relationship {
            id: RelationshipId::new_v4(),
            spouse_id,
            start_date: dates.start_date,
            end_date: dates.end_date,
        };

        let mut relative_links = RelativeLinks::from(&relative);
        relative_links.relationships.push(relationship);
        let mut spouse_links = RelativeLinks::from(&spouse);
        spouse_links
            .relationships
            .push(relationship.mirrored(relative_id));

        self.apply_writes(
            &tree,
            vec![
                link_write(&relative, relative_links),
                link_write(&spouse, spouse_links),
            ],
        )
        .await?;
        tracing::debug!(relationship_id = %relationship.id, relative_id = %relative_id, spouse_id = %spouse_id, "added relationship");
        Ok(relationship)
    }

    /// Changes the dates of a relationship on both mirrored copies.
    pub async fn update_relationship(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
        relationship_id: RelationshipId,
        dates: RelationshipDatesPayload,
    ) -> Result<Relationship> {
        self.retry_on_conflict("update_relationship", move || {
            self.try_update_relationship(actor, tree_id, relative_id, relationship_id, dates)
        })
        .await
    }

    async fn try_update_relationship(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
        relationship_id: RelationshipId,
        dates: RelationshipDatesPayload,
    ) -> Result<Relationship> {
        let (tree, _) = self
            .authorize(actor, tree_id, permissions::RELATIVE_EDIT_ROLE)
            .await?;
        invariants::validate_interval(dates.start_date, dates.end_date)?;

        let relative = self.load_relative(tree_id, relative_id).await?;
        let current = *relative
            .relationship(relationship_id)
            .ok_or_else(|| relationship_not_found(relative_id, relationship_id))?;
        let spouse = self.load_relative(tree_id, current.spouse_id).await?;
        if spouse.relationship(relationship_id).is_none() {
            return Err(relationship_not_found(spouse.id, relationship_id));
        }

        let proposed = ProposedRelationship {
            relative_id,
            spouse_id: spouse.id,
            start_date: dates.start_date,
            end_date: dates.end_date,
            replacing: Some(relationship_id),
        };
        let pair = invariants::pair_relationships(&relative, &spouse);
        invariants::ensure_relationship_invariants(&proposed, &pair)?;

        let updated = Relationship {
            start_date: dates.start_date,
            end_date: dates.end_date,
            ..current
        };
        let relative_links = replace_relationship(&relative, updated);
        let spouse_links = replace_relationship(&spouse, updated.mirrored(relative_id));

        self.apply_writes(
            &tree,
            vec![
                link_write(&relative, relative_links),
                link_write(&spouse, spouse_links),
            ],
        )
        .await?;
        Ok(updated)
    }

    /// Removes a relationship from both endpoints. Succeeds when it is already gone.
    pub async fn remove_relationship(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
        relationship_id: RelationshipId,
    ) -> Result<()> {
        self.retry_on_conflict("remove_relationship", move || {
            self.try_remove_relationship(actor, tree_id, relative_id, relationship_id)
        })
        .await
    }

    async fn try_remove_relationship(
        &self,
        actor: UserId,
        tree_id: TreeId,
        relative_id: RelativeId,
        relationship_id: RelationshipId,
    ) -> Result<()> {
        let (tree, _) = self
            .authorize(actor, tree_id, permissions::RELATIVE_DELETE_ROLE)
            .await?;
        let relative = self.load_relative(tree_id, relative_id).await?;

        // A copy left behind on the spouse alone is found through the reverse lookup.
        let spouse = match relative.relationship(relationship_id) {
            Some(relationship) => self.load_optional(tree_id, relationship.spouse_id).await?,
            None => self
                .store
                .find_relatives(RelativeFilter {
                    tree_id: Some(tree_id),
                    references: Some(relative_id),
                })
                .await?
                .into_iter()
                .find(|candidate| candidate.relationship(relationship_id).is_some()),
        };

        let mut writes = Vec::with_capacity(2);
        for holder in std::iter::once(&relative).chain(spouse.as_ref()) {
            if holder.relationship(relationship_id).is_some() {
                let mut links = RelativeLinks::from(holder);
                links
                    .relationships
                    .retain(|relationship| relationship.id != relationship_id);
                writes.push(link_write(holder, links));
            }
        }
        if writes.is_empty() {
            return Ok(());
        }

        self.apply_writes(&tree, writes).await
    }

    /// Lists every one-sided or dangling link in the tree.
    pub async fn audit_tree(&self, actor: UserId, tree_id: TreeId) -> Result<Vec<LinkViolation>> {
        self.authorize(actor, tree_id, permissions::TREE_ADMIN_ROLE)
            .await?;
        let relatives = self
            .store
            .find_relatives(RelativeFilter::tree(tree_id))
            .await?;
        Ok(algorithms::link_violations(&relatives))
    }

    // Plumbing

    async fn authorize(&self, actor: UserId, tree_id: TreeId, required: Role) -> Result<(Tree, Role)> {
        let tree = self.store.get_tree(tree_id).await?;
        let role = permissions::require_role(&tree, actor, required)?;
        Ok((tree, role))
    }

    async fn load_relative(&self, tree_id: TreeId, relative_id: RelativeId) -> Result<Relative> {
        let relative = self.store.get_relative(relative_id).await?;
        if relative.tree_id != tree_id {
            return Err(LibError::not_found(
                "Relative not found",
                anyhow!("relative {} belongs to tree {}, not {}", relative_id, relative.tree_id, tree_id),
            ));
        }
        Ok(relative)
    }

    async fn load_optional(
        &self,
        tree_id: TreeId,
        relative_id: RelativeId,
    ) -> Result<Option<Relative>> {
        match self.load_relative(tree_id, relative_id).await {
            Ok(relative) => Ok(Some(relative)),
            Err(err) if err.kind == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn hydrate(&self, tree_id: TreeId, ids: &[RelativeId]) -> Result<Vec<Relative>> {
        let mut relatives = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(relative) = self.load_optional(tree_id, *id).await? {
                relatives.push(relative);
            }
        }
        Ok(relatives)
    }

    /// Applies a set of conditional writes decided against `tree`'s current revision.
    ///
    /// Transactional stores get one batch guarded by the tree revision. Otherwise updates go
    /// out in ascending relative id order with deletions last, and a failure after the first
    /// landed write becomes a `PartialWriteFailure`.
    async fn apply_writes(&self, tree: &Tree, mut writes: Vec<StoreWrite>) -> Result<()> {
        if self.store.supports_transactions() {
            let mut batch = Vec::with_capacity(writes.len() + 1);
            batch.push(StoreWrite::AssertTree {
                tree_id: tree.id,
                revision: tree.revision,
            });
            batch.extend(writes);
            tracing::debug!(tree_id = %tree.id, writes = batch.len(), "committing write batch");
            return self.store.commit(batch).await;
        }

        let current = self.store.get_tree(tree.id).await?;
        if current.revision != tree.revision {
            return Err(LibError::conflict(
                "Tree was modified concurrently",
                anyhow!(
                    "tree {} moved from revision {} to {}",
                    tree.id,
                    tree.revision,
                    current.revision
                ),
            ));
        }

        writes.sort_by_key(|write| match write {
            StoreWrite::DeleteRelative { .. } => (1, write.relative_id()),
            _ => (0, write.relative_id()),
        });

        let mut written = Vec::with_capacity(writes.len());
        for write in writes {
            let Some(relative_id) = write.relative_id() else {
                continue;
            };
            tracing::debug!(tree_id = %tree.id, relative_id = %relative_id, "writing relative");
            let result = match write {
                StoreWrite::UpdateRelative {
                    relative_id,
                    expected_revision,
                    patch,
                } => self
                    .store
                    .update_relative(relative_id, patch, Some(expected_revision))
                    .await
                    .map(|_| ()),
                StoreWrite::DeleteRelative {
                    relative_id,
                    expected_revision,
                } => {
                    self.store
                        .delete_relative(relative_id, Some(expected_revision))
                        .await
                }
                StoreWrite::AssertTree { .. } => Ok(()),
            };

            match result {
                Ok(()) => written.push(relative_id),
                Err(err) if written.is_empty() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        tree_id = %tree.id,
                        failed = %relative_id,
                        written = written.len(),
                        error = %err,
                        "mirrored write failed partway"
                    );
                    return Err(LibError::partial_write(written, relative_id, err));
                }
            }
        }
        Ok(())
    }

    async fn retry_on_conflict<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Err(err)
                    if err.kind == ErrorKind::Conflict
                        && retries < self.config.max_conflict_retries =>
                {
                    retries += 1;
                    tracing::debug!(operation, retries, error = %err, "retrying after write conflict");
                }
                result => return result,
            }
        }
    }
}

fn link_write(relative: &Relative, links: RelativeLinks) -> StoreWrite {
    StoreWrite::UpdateRelative {
        relative_id: relative.id,
        expected_revision: relative.revision,
        patch: RelativePatch::Links(links),
    }
}

fn replace_relationship(relative: &Relative, updated: Relationship) -> RelativeLinks {
    let mut links = RelativeLinks::from(relative);
    for relationship in &mut links.relationships {
        if relationship.id == updated.id {
            *relationship = updated;
        }
    }
    links
}

fn relationship_not_found(relative_id: RelativeId, relationship_id: RelationshipId) -> LibError {
    LibError::not_found(
        "Relationship not found",
        anyhow!(
            "relationship {} missing on relative {}",
            relationship_id,
            relative_id
        ),
    )
}

fn target_member(tree: &Tree, user_id: UserId) -> Result<TreeMember> {
    tree.member(user_id).copied().ok_or_else(|| {
        LibError::not_found(
            "User is not a member of that tree",
            anyhow!("user {} is not a member of tree {}", user_id, tree.id),
        )
    })
}

fn require_admin(tree: &Tree, acting_role: Role) -> Result<()> {
    if acting_role < permissions::TREE_ADMIN_ROLE {
        return Err(LibError::forbidden(
            "Tree not found, or permission denied",
            anyhow!("role {} cannot manage members of tree {}", acting_role, tree.id),
        ));
    }
    Ok(())
}

fn require_not_superior(tree: &Tree, target: &TreeMember, acting_role: Role) -> Result<()> {
    if target.role > acting_role {
        return Err(LibError::forbidden(
            "Cannot change the role of a user with a higher role than your own",
            anyhow!(
                "role {} cannot modify member {} with role {} on tree {}",
                acting_role,
                target.user_id,
                target.role,
                tree.id
            ),
        ));
    }
    Ok(())
}

fn require_remaining_admin(tree: &Tree, target: &TreeMember, new_role: Option<Role>) -> Result<()> {
    let demoted = target.role == Role::Admin && new_role.is_none_or(|role| role < Role::Admin);
    if demoted && tree.admin_count() <= 1 {
        return Err(LibError::last_admin(
            "Could not remove the only admin for this tree",
            anyhow!("tree {} would be left without an admin", tree.id),
        ));
    }
    Ok(())
}

fn require_grantable(role: Role, acting_role: Role) -> Result<()> {
    if role > acting_role {
        return Err(LibError::forbidden(
            "You cannot grant a role higher than your own",
            anyhow!("role {} attempted to grant {}", acting_role, role),
        ));
    }
    Ok(())
}

/// Membership list with `user_id` holding `new_role`, or why `acting_role` may not do that.
pub fn updated_membership(
    tree: &Tree,
    user_id: UserId,
    new_role: Role,
    acting_role: Role,
) -> Result<Vec<TreeMember>> {
    require_admin(tree, acting_role)?;
    require_grantable(new_role, acting_role)?;
    let target = target_member(tree, user_id)?;
    require_not_superior(tree, &target, acting_role)?;
    require_remaining_admin(tree, &target, Some(new_role))?;

    Ok(tree
        .members
        .iter()
        .map(|member| {
            if member.user_id == user_id {
                TreeMember {
                    user_id,
                    role: new_role,
                }
            } else {
                *member
            }
        })
        .collect())
}

pub fn added_membership(
    tree: &Tree,
    user_id: UserId,
    role: Role,
    acting_role: Role,
) -> Result<Vec<TreeMember>> {
    require_admin(tree, acting_role)?;
    require_grantable(role, acting_role)?;
    if tree.member(user_id).is_some() {
        return Err(LibError::invalid(
            "User already is attached to that tree",
            anyhow!("user {} already a member of tree {}", user_id, tree.id),
        ));
    }

    let mut members = tree.members.clone();
    members.push(TreeMember { user_id, role });
    Ok(members)
}

pub fn removed_membership(tree: &Tree, user_id: UserId, acting_role: Role) -> Result<Vec<TreeMember>> {
    require_admin(tree, acting_role)?;
    let target = target_member(tree, user_id)?;
    require_not_superior(tree, &target, acting_role)?;
    require_remaining_admin(tree, &target, None)?;

    Ok(tree
        .members
        .iter()
        .filter(|member| member.user_id != user_id)
        .copied()
        .collect())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;
    use crate::error::ErrorDetails;
    use crate::store::{Fault, MemoryStore};

    fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        Some(NaiveDate::from_ymd_opt(y, m, d).expect("valid date"))
    }

    fn dates(start_date: Option<NaiveDate>, end_date: Option<NaiveDate>) -> RelationshipDatesPayload {
        RelationshipDatesPayload {
            start_date,
            end_date,
        }
    }

    async fn setup(store: MemoryStore) -> (FamilyTreeOperations<MemoryStore>, UserId, Tree) {
        let ops = FamilyTreeOperations::new(Arc::new(store));
        let admin = UserId::new_v4();
        let tree = ops
            .create_tree(
                admin,
                CreateTreePayload {
                    name: " Lovelace ".to_string(),
                    private: None,
                },
            )
            .await
            .expect("create tree");
        (ops, admin, tree)
    }

    async fn person(
        ops: &FamilyTreeOperations<MemoryStore>,
        actor: UserId,
        tree_id: TreeId,
        first_name: &str,
    ) -> Relative {
        ops.create_relative(
            actor,
            tree_id,
            CreateRelativePayload {
                first_name: first_name.to_string(),
                last_name: "Byron".to_string(),
                gender: None,
                birthdate: None,
                deathdate: None,
                attributes: None,
            },
        )
        .await
        .expect("create relative")
    }

    async fn member(
        ops: &FamilyTreeOperations<MemoryStore>,
        admin: UserId,
        tree_id: TreeId,
        role: Role,
    ) -> UserId {
        let user_id = UserId::new_v4();
        ops.add_member(admin, tree_id, user_id, role)
            .await
            .expect("add member");
        user_id
    }

    #[tokio::test]
    async fn creator_becomes_sole_admin_of_private_tree() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        assert_eq!(tree.name, "Lovelace");
        assert!(tree.private);
        assert_eq!(
            tree.members,
            vec![TreeMember {
                user_id: admin,
                role: Role::Admin,
            }]
        );

        let listed = ops.list_trees(admin).await.expect("list trees");
        assert_eq!(listed.len(), 1);
        assert!(
            ops.list_trees(UserId::new_v4())
                .await
                .expect("list trees")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn add_child_links_both_sides_once() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let parent = person(&ops, admin, tree.id, "Ada").await;
        let child = person(&ops, admin, tree.id, "Byron").await;

        ops.add_child(admin, tree.id, parent.id, child.id)
            .await
            .expect("first link");
        let parent_after = ops
            .add_child(admin, tree.id, parent.id, child.id)
            .await
            .expect("repeat link is a no-op");
        assert_eq!(parent_after.children, vec![child.id]);

        let child_after = ops
            .get_relative(admin, tree.id, child.id)
            .await
            .expect("child");
        assert_eq!(child_after.parents, vec![parent.id]);

        let children = ops
            .get_children(admin, tree.id, parent.id)
            .await
            .expect("children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
        let parents = ops
            .get_parents(admin, tree.id, child.id)
            .await
            .expect("parents");
        assert_eq!(parents[0].id, parent.id);
    }

    #[tokio::test]
    async fn remove_child_twice_is_a_no_op() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let parent = person(&ops, admin, tree.id, "Ada").await;
        let child = person(&ops, admin, tree.id, "Byron").await;
        ops.add_child(admin, tree.id, parent.id, child.id)
            .await
            .expect("link");

        ops.remove_child(admin, tree.id, parent.id, child.id)
            .await
            .expect("first removal");
        ops.remove_child(admin, tree.id, parent.id, child.id)
            .await
            .expect("second removal succeeds");

        let parent = ops.get_relative(admin, tree.id, parent.id).await.expect("parent");
        let child = ops.get_relative(admin, tree.id, child.id).await.expect("child");
        assert!(parent.children.is_empty());
        assert!(child.parents.is_empty());
    }

    #[tokio::test]
    async fn add_child_rejects_self_and_cross_tree_links() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let ada = person(&ops, admin, tree.id, "Ada").await;

        let err = ops
            .add_child(admin, tree.id, ada.id, ada.id)
            .await
            .expect_err("self link should fail");
        assert_eq!(err.kind, ErrorKind::SelfReference);

        let other_tree = ops
            .create_tree(
                admin,
                CreateTreePayload {
                    name: "Other".to_string(),
                    private: Some(true),
                },
            )
            .await
            .expect("create tree");
        let stranger = person(&ops, admin, other_tree.id, "Stranger").await;
        let err = ops
            .add_child(admin, tree.id, ada.id, stranger.id)
            .await
            .expect_err("relative from another tree should fail");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn relationship_intervals_follow_half_open_rules() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let a = person(&ops, admin, tree.id, "A").await;
        let b = person(&ops, admin, tree.id, "B").await;

        let first = ops
            .add_relationship(admin, tree.id, a.id, b.id, dates(date(2000, 1, 1), date(2010, 1, 1)))
            .await
            .expect("first relationship");

        let a_after = ops.get_relative(admin, tree.id, a.id).await.expect("a");
        let b_after = ops.get_relative(admin, tree.id, b.id).await.expect("b");
        assert_eq!(a_after.relationship(first.id), Some(&first));
        assert_eq!(b_after.relationship(first.id), Some(&first.mirrored(a.id)));

        let err = ops
            .add_relationship(admin, tree.id, a.id, b.id, dates(date(2005, 1, 1), None))
            .await
            .expect_err("overlap should fail");
        assert_eq!(err.kind, ErrorKind::OverlappingInterval);
        assert_eq!(
            err.details,
            Some(ErrorDetails::ConflictingRelationship {
                relationship_id: first.id,
            })
        );

        ops.add_relationship(admin, tree.id, a.id, b.id, dates(date(2010, 1, 1), date(2012, 1, 1)))
            .await
            .expect("boundary touching relationship");

        let err = ops
            .add_relationship(admin, tree.id, b.id, a.id, dates(date(2011, 1, 1), date(2011, 6, 1)))
            .await
            .expect_err("overlap is checked from the spouse side too");
        assert_eq!(err.kind, ErrorKind::OverlappingInterval);

        let links = ops
            .get_relationships(admin, tree.id, a.id)
            .await
            .expect("relationships");
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|link| link.spouse.id == b.id));
    }

    #[tokio::test]
    async fn relationship_validation_errors() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let a = person(&ops, admin, tree.id, "A").await;
        let b = person(&ops, admin, tree.id, "B").await;

        let err = ops
            .add_relationship(admin, tree.id, a.id, a.id, dates(None, None))
            .await
            .expect_err("self relationship");
        assert_eq!(err.kind, ErrorKind::SelfReference);

        let err = ops
            .add_relationship(admin, tree.id, a.id, b.id, dates(date(2010, 1, 1), date(2000, 1, 1)))
            .await
            .expect_err("inverted range");
        assert_eq!(err.kind, ErrorKind::InvalidRange);

        ops.add_relationship(admin, tree.id, a.id, b.id, dates(date(2000, 1, 1), None))
            .await
            .expect("open relationship");
        let err = ops
            .add_relationship(admin, tree.id, a.id, b.id, dates(None, date(1990, 1, 1)))
            .await
            .expect_err("second open relationship");
        assert_eq!(err.kind, ErrorKind::AmbiguousOpenInterval);
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn copy_held_only_by_spouse_still_blocks_overlap() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let a = person(&ops, admin, tree.id, "A").await;
        let b = person(&ops, admin, tree.id, "B").await;
        ops.add_relationship(admin, tree.id, a.id, b.id, dates(date(2000, 1, 1), date(2010, 1, 1)))
            .await
            .expect("relationship");

        let mut a_stripped = ops.get_relative(admin, tree.id, a.id).await.expect("a");
        a_stripped.relationships.clear();
        ops.store().put_relative(a_stripped).await;

        let err = ops
            .add_relationship(admin, tree.id, a.id, b.id, dates(date(2001, 1, 1), date(2002, 1, 1)))
            .await
            .expect_err("spouse copy should conflict");
        assert_eq!(err.kind, ErrorKind::OverlappingInterval);
    }

    #[tokio::test]
    async fn update_relationship_rewrites_both_mirrors() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let a = person(&ops, admin, tree.id, "A").await;
        let b = person(&ops, admin, tree.id, "B").await;
        let first = ops
            .add_relationship(admin, tree.id, a.id, b.id, dates(date(2000, 1, 1), date(2010, 1, 1)))
            .await
            .expect("first");
        let second = ops
            .add_relationship(admin, tree.id, a.id, b.id, dates(date(2010, 1, 1), date(2012, 1, 1)))
            .await
            .expect("second");

        let err = ops
            .update_relationship(admin, tree.id, a.id, second.id, dates(date(2009, 1, 1), date(2012, 1, 1)))
            .await
            .expect_err("moved into first interval");
        assert_eq!(err.kind, ErrorKind::OverlappingInterval);

        let updated = ops
            .update_relationship(admin, tree.id, b.id, first.id, dates(date(1999, 1, 1), date(2010, 1, 1)))
            .await
            .expect("editing the same relationship excludes itself");
        assert_eq!(updated.start_date, date(1999, 1, 1));
        assert_eq!(updated.spouse_id, a.id);

        let a_after = ops.get_relative(admin, tree.id, a.id).await.expect("a");
        let b_after = ops.get_relative(admin, tree.id, b.id).await.expect("b");
        assert_eq!(
            a_after.relationship(first.id).map(|r| r.start_date),
            Some(date(1999, 1, 1))
        );
        assert_eq!(b_after.relationship(first.id), Some(&updated));

        let err = ops
            .update_relationship(admin, tree.id, a.id, RelationshipId::new_v4(), dates(None, None))
            .await
            .expect_err("unknown relationship");
        assert_eq!(err.kind, ErrorKind::NotFound);

        let mut b_stripped = b_after.clone();
        b_stripped.relationships.retain(|r| r.id != second.id);
        ops.store().put_relative(b_stripped).await;
        let err = ops
            .update_relationship(admin, tree.id, a.id, second.id, dates(date(2010, 1, 1), date(2011, 1, 1)))
            .await
            .expect_err("missing mirror");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn remove_relationship_is_idempotent_and_finds_orphaned_copies() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let a = person(&ops, admin, tree.id, "A").await;
        let b = person(&ops, admin, tree.id, "B").await;
        let relationship = ops
            .add_relationship(admin, tree.id, a.id, b.id, dates(None, None))
            .await
            .expect("relationship");

        let mut a_stripped = ops.get_relative(admin, tree.id, a.id).await.expect("a");
        a_stripped.relationships.clear();
        ops.store().put_relative(a_stripped).await;

        ops.remove_relationship(admin, tree.id, a.id, relationship.id)
            .await
            .expect("removes spouse copy");
        let b_after = ops.get_relative(admin, tree.id, b.id).await.expect("b");
        assert!(b_after.relationships.is_empty());

        ops.remove_relationship(admin, tree.id, a.id, relationship.id)
            .await
            .expect("repeat removal succeeds");
    }

    #[tokio::test]
    async fn delete_relative_leaves_no_references() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let target = person(&ops, admin, tree.id, "Target").await;
        let child = person(&ops, admin, tree.id, "Child").await;
        let parent = person(&ops, admin, tree.id, "Parent").await;
        let spouse = person(&ops, admin, tree.id, "Spouse").await;
        let stray = person(&ops, admin, tree.id, "Stray").await;

        ops.add_child(admin, tree.id, target.id, child.id)
            .await
            .expect("child link");
        ops.add_child(admin, tree.id, parent.id, target.id)
            .await
            .expect("parent link");
        ops.add_relationship(admin, tree.id, target.id, spouse.id, dates(None, None))
            .await
            .expect("relationship");
        let mut stray = ops.get_relative(admin, tree.id, stray.id).await.expect("stray");
        stray.parents.push(target.id);
        ops.store().put_relative(stray).await;

        ops.delete_relative(admin, tree.id, target.id)
            .await
            .expect("delete relative");

        let err = ops
            .get_relative(admin, tree.id, target.id)
            .await
            .expect_err("deleted");
        assert_eq!(err.kind, ErrorKind::NotFound);
        let remaining = ops.list_relatives(admin, tree.id).await.expect("list");
        assert_eq!(remaining.len(), 4);
        assert!(remaining.iter().all(|relative| !relative.references(target.id)));
        assert!(ops.audit_tree(admin, tree.id).await.expect("audit").is_empty());
    }

    #[tokio::test]
    async fn delete_relative_leaves_other_trees_untouched() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let other_tree = ops
            .create_tree(
                admin,
                CreateTreePayload {
                    name: "Elsewhere".to_string(),
                    private: None,
                },
            )
            .await
            .expect("other tree");
        let target = person(&ops, admin, tree.id, "Target").await;
        let outsider = person(&ops, admin, other_tree.id, "Outsider").await;

        let mut target = ops.get_relative(admin, tree.id, target.id).await.expect("target");
        target.children.push(outsider.id);
        ops.store().put_relative(target.clone()).await;
        let mut outsider = ops
            .get_relative(admin, other_tree.id, outsider.id)
            .await
            .expect("outsider");
        outsider.parents.push(target.id);
        ops.store().put_relative(outsider.clone()).await;

        ops.delete_relative(admin, tree.id, target.id)
            .await
            .expect("delete relative");

        let after = ops
            .get_relative(admin, other_tree.id, outsider.id)
            .await
            .expect("outsider survives");
        assert_eq!(after.revision, outsider.revision);
        assert_eq!(after.parents, vec![target.id]);
    }

    #[tokio::test]
    async fn add_child_returns_the_parent_it_wrote() {
        for store in [MemoryStore::new(), MemoryStore::without_transactions()] {
            let (ops, admin, tree) = setup(store).await;
            let parent = person(&ops, admin, tree.id, "Parent").await;
            let child = person(&ops, admin, tree.id, "Child").await;

            let linked = ops
                .add_child(admin, tree.id, parent.id, child.id)
                .await
                .expect("child link");
            assert_eq!(linked.children, vec![child.id]);
            assert_eq!(linked.revision, parent.revision + 1);
            let stored = ops.get_relative(admin, tree.id, parent.id).await.expect("parent");
            assert_eq!(stored.children, linked.children);
            assert_eq!(stored.revision, linked.revision);

            // Only the child's side is missing: the parent is returned as read.
            let mut unlinked = ops.get_relative(admin, tree.id, child.id).await.expect("child");
            unlinked.parents.clear();
            ops.store().put_relative(unlinked).await;
            let relinked = ops
                .add_child(admin, tree.id, parent.id, child.id)
                .await
                .expect("repair link");
            assert_eq!(relinked.revision, linked.revision);
            assert_eq!(relinked.children, vec![child.id]);
        }
    }

    #[tokio::test]
    async fn delete_tree_cascades_to_relatives() {
        let store = Arc::new(MemoryStore::new());
        let ops = FamilyTreeOperations::new(Arc::clone(&store));
        let admin = UserId::new_v4();
        let tree = ops
            .create_tree(
                admin,
                CreateTreePayload {
                    name: "Doomed".to_string(),
                    private: None,
                },
            )
            .await
            .expect("tree");
        person(&ops, admin, tree.id, "A").await;
        person(&ops, admin, tree.id, "B").await;

        let editor = member(&ops, admin, tree.id, Role::Edit).await;
        let err = ops
            .delete_tree(editor, tree.id)
            .await
            .expect_err("editor cannot delete tree");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        ops.delete_tree(admin, tree.id).await.expect("delete tree");
        let err = ops.get_tree(admin, tree.id).await.expect_err("tree gone");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(
            store
                .find_relatives(RelativeFilter::tree(tree.id))
                .await
                .expect("find")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn sole_admin_cannot_be_demoted_or_removed() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;

        let err = ops
            .update_tree_membership(admin, tree.id, admin, Role::Edit)
            .await
            .expect_err("sole admin demotion");
        assert_eq!(err.kind, ErrorKind::LastAdminViolation);
        let err = ops
            .remove_member(admin, tree.id, admin)
            .await
            .expect_err("sole admin removal");
        assert_eq!(err.kind, ErrorKind::LastAdminViolation);

        let co_admin = member(&ops, admin, tree.id, Role::Admin).await;
        let members = ops
            .update_tree_membership(co_admin, tree.id, admin, Role::Edit)
            .await
            .expect("one of two admins can be demoted");
        assert!(members.contains(&TreeMember {
            user_id: admin,
            role: Role::Edit,
        }));
    }

    #[tokio::test]
    async fn membership_changes_cannot_escalate() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let editor = member(&ops, admin, tree.id, Role::Edit).await;
        let reader = member(&ops, admin, tree.id, Role::Read).await;

        let err = ops
            .update_tree_membership(editor, tree.id, reader, Role::Add)
            .await
            .expect_err("editors cannot manage members");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        let err = ops
            .update_tree_membership(admin, tree.id, UserId::new_v4(), Role::Read)
            .await
            .expect_err("unknown member");
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err = ops
            .add_member(admin, tree.id, reader, Role::Read)
            .await
            .expect_err("duplicate member");
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        let tree_now = ops.get_tree(admin, tree.id).await.expect("tree");
        let err = updated_membership(&tree_now, reader, Role::Admin, Role::Edit)
            .expect_err("granting above own role");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        let err = updated_membership(&tree_now, admin, Role::Read, Role::Edit)
            .expect_err("touching a superior");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        let members = ops
            .remove_member(admin, tree.id, reader)
            .await
            .expect("remove reader");
        assert!(members.iter().all(|member| member.user_id != reader));
    }

    #[tokio::test]
    async fn operations_enforce_role_thresholds() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let reader = member(&ops, admin, tree.id, Role::Read).await;
        let adder = member(&ops, admin, tree.id, Role::Add).await;
        let editor = member(&ops, admin, tree.id, Role::Edit).await;
        let outsider = UserId::new_v4();

        let err = ops
            .create_relative(
                reader,
                tree.id,
                CreateRelativePayload {
                    first_name: "R".to_string(),
                    last_name: "R".to_string(),
                    gender: None,
                    birthdate: None,
                    deathdate: None,
                    attributes: None,
                },
            )
            .await
            .expect_err("readers cannot add");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        let added = person(&ops, adder, tree.id, "Added").await;
        let err = ops
            .update_relative(
                adder,
                tree.id,
                added.id,
                UpdateRelativePayload {
                    first_name: Some("Renamed".to_string()),
                    ..UpdateRelativePayload::default()
                },
            )
            .await
            .expect_err("adders cannot edit");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        let renamed = ops
            .update_relative(
                editor,
                tree.id,
                added.id,
                UpdateRelativePayload {
                    first_name: Some(" Renamed ".to_string()),
                    ..UpdateRelativePayload::default()
                },
            )
            .await
            .expect("editors can edit");
        assert_eq!(renamed.first_name, "Renamed");
        assert_eq!(renamed.revision, added.revision + 1);

        let err = ops
            .delete_relative(editor, tree.id, added.id)
            .await
            .expect_err("editors cannot delete");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        let err = ops
            .get_tree(outsider, tree.id)
            .await
            .expect_err("private tree hidden from outsiders");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        let err = ops
            .update_tree(
                editor,
                tree.id,
                UpdateTreePayload {
                    private: Some(false),
                    ..UpdateTreePayload::default()
                },
            )
            .await
            .expect_err("editors cannot change privacy");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        ops.update_tree(
            admin,
            tree.id,
            UpdateTreePayload {
                private: Some(false),
                ..UpdateTreePayload::default()
            },
        )
        .await
        .expect("admin publishes tree");
        ops.get_tree(outsider, tree.id)
            .await
            .expect("public tree readable by outsiders");
        let err = person_err(&ops, outsider, tree.id).await;
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    async fn person_err(
        ops: &FamilyTreeOperations<MemoryStore>,
        actor: UserId,
        tree_id: TreeId,
    ) -> LibError {
        ops.create_relative(
            actor,
            tree_id,
            CreateRelativePayload {
                first_name: "X".to_string(),
                last_name: "Y".to_string(),
                gender: None,
                birthdate: None,
                deathdate: None,
                attributes: None,
            },
        )
        .await
        .expect_err("create should fail")
    }

    #[tokio::test]
    async fn unordered_store_reports_partial_write() {
        let (ops, admin, tree) = setup(MemoryStore::without_transactions()).await;
        let a = person(&ops, admin, tree.id, "A").await;
        let b = person(&ops, admin, tree.id, "B").await;
        let (low, high) = if a.id < b.id { (a.id, b.id) } else { (b.id, a.id) };

        ops.store().inject_fault(high, Fault::Timeout).await;
        let err = ops
            .add_child(admin, tree.id, a.id, b.id)
            .await
            .expect_err("second write times out");
        assert_eq!(err.kind, ErrorKind::PartialWriteFailure);
        assert_eq!(
            err.details,
            Some(ErrorDetails::PartialWrite {
                written: vec![low],
                failed: high,
            })
        );

        let low_after = ops.get_relative(admin, tree.id, low).await.expect("low");
        let high_after = ops.get_relative(admin, tree.id, high).await.expect("high");
        assert!(low_after.references(high));
        assert!(!high_after.references(low));
        assert!(!ops.audit_tree(admin, tree.id).await.expect("audit").is_empty());
    }

    #[tokio::test]
    async fn storage_timeout_before_any_write_is_not_masked() {
        let (ops, admin, tree) = setup(MemoryStore::without_transactions()).await;
        let a = person(&ops, admin, tree.id, "A").await;
        let b = person(&ops, admin, tree.id, "B").await;
        let low = a.id.min(b.id);

        ops.store().inject_fault(low, Fault::Timeout).await;
        let err = ops
            .add_relationship(admin, tree.id, a.id, b.id, dates(None, None))
            .await
            .expect_err("first write times out");
        assert_eq!(err.kind, ErrorKind::StorageTimeout);

        ops.store().clear_faults().await;
        ops.add_relationship(admin, tree.id, a.id, b.id, dates(None, None))
            .await
            .expect("succeeds once storage recovers");
    }

    #[tokio::test]
    async fn lost_race_is_retried_from_fresh_reads() {
        let (ops, admin, tree) = setup(MemoryStore::new()).await;
        let a = person(&ops, admin, tree.id, "A").await;
        let b = person(&ops, admin, tree.id, "B").await;

        ops.store().inject_fault(b.id, Fault::ConflictOnce).await;
        ops.add_child(admin, tree.id, a.id, b.id)
            .await
            .expect("retried after conflict");
        let b_after = ops.get_relative(admin, tree.id, b.id).await.expect("b");
        assert_eq!(b_after.parents, vec![a.id]);

        let strict = FamilyTreeOperations::with_config(
            ops.store(),
            CoordinatorConfig {
                max_conflict_retries: 0,
            },
        );
        strict.store().inject_fault(a.id, Fault::ConflictOnce).await;
        let err = strict
            .remove_child(admin, tree.id, a.id, b.id)
            .await
            .expect_err("no retries allowed");
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn unordered_store_retries_conflict_before_first_write() {
        let (ops, admin, tree) = setup(MemoryStore::without_transactions()).await;
        let a = person(&ops, admin, tree.id, "A").await;
        let b = person(&ops, admin, tree.id, "B").await;

        ops.store().inject_fault(a.id.min(b.id), Fault::ConflictOnce).await;
        ops.add_child(admin, tree.id, a.id, b.id)
            .await
            .expect("retried after conflict");
        assert!(ops.audit_tree(admin, tree.id).await.expect("audit").is_empty());
    }

    #[tokio::test]
    async fn execute_dispatches_tagged_operations() {
        let ops = FamilyTreeOperations::new(Arc::new(MemoryStore::new()));
        let admin = UserId::new_v4();

        let operation: FamilyOperation = serde_json::from_value(json!({
            "operation": "create_tree",
            "payload": {"name": "Tagged"}
        }))
        .expect("valid operation");
        let FamilyOperationResult::Tree { tree } =
            ops.execute(admin, operation).await.expect("create tree")
        else {
            panic!("expected tree result");
        };

        let a = person(&ops, admin, tree.id, "A").await;
        let b = person(&ops, admin, tree.id, "B").await;
        let operation: FamilyOperation = serde_json::from_value(json!({
            "operation": "add_relationship",
            "tree_id": tree.id,
            "relative_id": a.id,
            "spouse_id": b.id,
            "dates": {"startDate": "2000-01-01", "endDate": "2010-01-01"}
        }))
        .expect("valid operation");
        let result = ops.execute(admin, operation).await.expect("add relationship");
        let value = serde_json::to_value(&result).expect("serializes");
        assert_eq!(value["result"], "relationship");
        assert_eq!(value["relationship"]["spouseId"], json!(b.id));

        let user_id = UserId::new_v4();
        ops.add_member(admin, tree.id, user_id, Role::Read)
            .await
            .expect("add member");
        let operation: FamilyOperation = serde_json::from_value(json!({
            "operation": "set_member_role",
            "tree_id": tree.id,
            "user_id": user_id,
            "role": 2
        }))
        .expect("valid operation");
        let FamilyOperationResult::Members { members } =
            ops.execute(admin, operation).await.expect("set role")
        else {
            panic!("expected members result");
        };
        assert!(members.contains(&TreeMember {
            user_id,
            role: Role::Edit,
        }));

        let relationship_id = value["relationship"]["id"].clone();
        let operation: FamilyOperation = serde_json::from_value(json!({
            "operation": "update_relationship",
            "tree_id": tree.id,
            "relative_id": a.id,
            "relationship_id": relationship_id,
            "dates": {"startDate": "2000-01-01", "endDate": "2005-01-01"}
        }))
        .expect("valid operation");
        let FamilyOperationResult::Relationship { relationship } =
            ops.execute(admin, operation).await.expect("update relationship")
        else {
            panic!("expected relationship result");
        };
        assert_eq!(relationship.end_date, date(2005, 1, 1));

        let operation: FamilyOperation = serde_json::from_value(json!({
            "operation": "update_relative",
            "tree_id": tree.id,
            "relative_id": b.id,
            "payload": {"firstName": "Bea"}
        }))
        .expect("valid operation");
        let FamilyOperationResult::Relative { relative } =
            ops.execute(admin, operation).await.expect("update relative")
        else {
            panic!("expected relative result");
        };
        assert_eq!(relative.first_name, "Bea");

        let operation: FamilyOperation = serde_json::from_value(json!({
            "operation": "get_relationships",
            "tree_id": tree.id,
            "relative_id": a.id
        }))
        .expect("valid operation");
        let FamilyOperationResult::Links { links } =
            ops.execute(admin, operation).await.expect("get relationships")
        else {
            panic!("expected links result");
        };
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].spouse.first_name, "Bea");
        assert_eq!(links[0].relationship.end_date, date(2005, 1, 1));

        let operation: FamilyOperation = serde_json::from_value(json!({
            "operation": "list_relatives",
            "tree_id": tree.id
        }))
        .expect("valid operation");
        let FamilyOperationResult::Relatives { items } =
            ops.execute(admin, operation).await.expect("list relatives")
        else {
            panic!("expected relatives result");
        };
        assert_eq!(items.len(), 2);

        let operation: FamilyOperation = serde_json::from_value(json!({
            "operation": "remove_member",
            "tree_id": tree.id,
            "user_id": user_id
        }))
        .expect("valid operation");
        let FamilyOperationResult::Members { members } =
            ops.execute(admin, operation).await.expect("remove member")
        else {
            panic!("expected members result");
        };
        assert!(members.iter().all(|member| member.user_id != user_id));

        let operation: FamilyOperation = serde_json::from_value(json!({
            "operation": "audit_tree",
            "tree_id": tree.id
        }))
        .expect("valid operation");
        let FamilyOperationResult::Violations { violations } =
            ops.execute(admin, operation).await.expect("audit tree")
        else {
            panic!("expected violations result");
        };
        assert!(violations.is_empty());
    }

    #[test]
    fn default_config_retries_three_times() {
        assert_eq!(CoordinatorConfig::default().max_conflict_retries, 3);
    }
}
