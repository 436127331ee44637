use std::collections::HashMap;
use std::future::Future;

use anyhow::anyhow;
use tokio::sync::Mutex;

use crate::error::{LibError, Result};
use crate::models::{
    Relative, RelativeId, RelativeLinks, RelativeProfile, Tree, TreeId, TreeMember, UserId,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct TreeFilter {
    /// Only trees listing this user in `members`.
    pub member: Option<UserId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RelativeFilter {
    pub tree_id: Option<TreeId>,
    /// Only relatives holding any link to this relative.
    pub references: Option<RelativeId>,
}

impl RelativeFilter {
    pub fn tree(tree_id: TreeId) -> Self {
        Self {
            tree_id: Some(tree_id),
            references: None,
        }
    }

    fn matches(&self, relative: &Relative) -> bool {
        self.tree_id.is_none_or(|tree_id| relative.tree_id == tree_id)
            && self
                .references
                .is_none_or(|other| relative.references(other))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TreePatch {
    pub name: Option<String>,
    pub private: Option<bool>,
    pub members: Option<Vec<TreeMember>>,
}

#[derive(Debug, Clone)]
pub enum RelativePatch {
    Links(RelativeLinks),
    Profile(RelativeProfile),
}

impl RelativePatch {
    fn apply(self, relative: &mut Relative) {
        match self {
            RelativePatch::Links(links) => {
                relative.children = links.children;
                relative.parents = links.parents;
                relative.relationships = links.relationships;
            }
            RelativePatch::Profile(profile) => {
                relative.first_name = profile.first_name;
                relative.last_name = profile.last_name;
                relative.gender = profile.gender;
                relative.birthdate = profile.birthdate;
                relative.deathdate = profile.deathdate;
                relative.attributes = profile.attributes;
            }
        }
    }
}

/// One step of a multi-record batch submitted through [`GraphStore::commit`].
#[derive(Debug, Clone)]
pub enum StoreWrite {
    /// Aborts the batch unless the tree still has this revision.
    AssertTree { tree_id: TreeId, revision: i64 },
    UpdateRelative {
        relative_id: RelativeId,
        expected_revision: i64,
        patch: RelativePatch,
    },
    DeleteRelative {
        relative_id: RelativeId,
        expected_revision: i64,
    },
}

impl StoreWrite {
    pub const fn relative_id(&self) -> Option<RelativeId> {
        match self {
            StoreWrite::AssertTree { .. } => None,
            StoreWrite::UpdateRelative { relative_id, .. }
            | StoreWrite::DeleteRelative { relative_id, .. } => Some(*relative_id),
        }
    }
}

/// Durable storage of trees and relatives.
///
/// Updates and deletes taking an `expected_revision` must fail with a `Conflict` error when the
/// stored revision differs, and every successful write bumps the record's revision by one.
/// Implementations report unreachable or slow storage as `StorageTimeout`, never `NotFound`.
pub trait GraphStore: Send + Sync {
    /// Whether [`GraphStore::commit`] applies a batch all-or-nothing.
    fn supports_transactions(&self) -> bool;

    fn get_tree(&self, tree_id: TreeId) -> impl Future<Output = Result<Tree>> + Send;

    fn find_trees(&self, filter: TreeFilter) -> impl Future<Output = Result<Vec<Tree>>> + Send;

    fn insert_tree(&self, tree: Tree) -> impl Future<Output = Result<Tree>> + Send;

    fn update_tree(
        &self,
        tree_id: TreeId,
        patch: TreePatch,
        expected_revision: Option<i64>,
    ) -> impl Future<Output = Result<Tree>> + Send;

    fn delete_tree(&self, tree_id: TreeId) -> impl Future<Output = Result<()>> + Send;

    fn get_relative(&self, relative_id: RelativeId)
    -> impl Future<Output = Result<Relative>> + Send;

    fn find_relatives(
        &self,
        filter: RelativeFilter,
    ) -> impl Future<Output = Result<Vec<Relative>>> + Send;

    fn insert_relative(&self, relative: Relative) -> impl Future<Output = Result<Relative>> + Send;

    fn update_relative(
        &self,
        relative_id: RelativeId,
        patch: RelativePatch,
        expected_revision: Option<i64>,
    ) -> impl Future<Output = Result<Relative>> + Send;

    fn delete_relative(
        &self,
        relative_id: RelativeId,
        expected_revision: Option<i64>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Applies `writes` atomically. Only called when `supports_transactions` is true.
    fn commit(&self, writes: Vec<StoreWrite>) -> impl Future<Output = Result<()>> + Send {
        async move {
            Err(LibError::database(
                "Storage does not support transactions",
                anyhow!("commit of {} write(s) on non-transactional store", writes.len()),
            ))
        }
    }
}

/// Simulated storage failure for a specific relative.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Every write times out.
    Timeout,
    /// The next conditional write loses a race against another writer.
    ConflictOnce,
}

#[derive(Debug, Default)]
struct MemoryState {
    trees: HashMap<TreeId, Tree>,
    relatives: HashMap<RelativeId, Relative>,
    #[cfg(test)]
    faults: HashMap<RelativeId, Fault>,
}

impl MemoryState {
    fn tree(&self, tree_id: TreeId) -> Result<&Tree> {
        self.trees.get(&tree_id).ok_or_else(|| tree_not_found(tree_id))
    }

    fn relative(&self, relative_id: RelativeId) -> Result<&Relative> {
        self.relatives
            .get(&relative_id)
            .ok_or_else(|| relative_not_found(relative_id))
    }

    #[cfg(test)]
    fn check_fault(&mut self, relative_id: RelativeId) -> Result<()> {
        match self.faults.get(&relative_id).copied() {
            Some(Fault::Timeout) => Err(LibError::storage_timeout(
                "Storage did not respond in time",
                anyhow!("injected timeout writing relative {}", relative_id),
            )),
            Some(Fault::ConflictOnce) => {
                self.faults.remove(&relative_id);
                if let Some(relative) = self.relatives.get_mut(&relative_id) {
                    relative.revision += 1;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    #[cfg(not(test))]
    fn check_fault(&mut self, _relative_id: RelativeId) -> Result<()> {
        Ok(())
    }

    fn check_relative_revision(
        &mut self,
        relative_id: RelativeId,
        expected_revision: Option<i64>,
    ) -> Result<()> {
        self.check_fault(relative_id)?;
        let relative = self.relative(relative_id)?;
        match expected_revision {
            Some(expected) if expected != relative.revision => Err(LibError::conflict(
                "Relative was modified concurrently",
                anyhow!(
                    "relative {} has revision {}, expected {}",
                    relative_id,
                    relative.revision,
                    expected
                ),
            )),
            _ => Ok(()),
        }
    }

    fn apply_relative_patch(
        &mut self,
        relative_id: RelativeId,
        patch: RelativePatch,
    ) -> Result<Relative> {
        let relative = self
            .relatives
            .get_mut(&relative_id)
            .ok_or_else(|| relative_not_found(relative_id))?;
        patch.apply(relative);
        relative.revision += 1;
        Ok(relative.clone())
    }
}

/// Arena-backed [`GraphStore`] keeping every record in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    transactional: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            transactional: true,
        }
    }

    /// A store that rejects batches, forcing callers onto ordered single-record writes.
    pub fn without_transactions() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            transactional: false,
        }
    }

    #[cfg(test)]
    pub(crate) async fn inject_fault(&self, relative_id: RelativeId, fault: Fault) {
        self.state.lock().await.faults.insert(relative_id, fault);
    }

    #[cfg(test)]
    pub(crate) async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    /// Overwrites a record without any checks, for seeding inconsistent fixtures.
    #[cfg(test)]
    pub(crate) async fn put_relative(&self, relative: Relative) {
        self.state
            .lock()
            .await
            .relatives
            .insert(relative.id, relative);
    }
}

impl GraphStore for MemoryStore {
    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn get_tree(&self, tree_id: TreeId) -> Result<Tree> {
        self.state.lock().await.tree(tree_id).cloned()
    }

    async fn find_trees(&self, filter: TreeFilter) -> Result<Vec<Tree>> {
        let state = self.state.lock().await;
        let mut trees = state
            .trees
            .values()
            .filter(|tree| {
                filter
                    .member
                    .is_none_or(|user_id| tree.member(user_id).is_some())
            })
            .cloned()
            .collect::<Vec<_>>();
        trees.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(trees)
    }

    async fn insert_tree(&self, tree: Tree) -> Result<Tree> {
        let mut state = self.state.lock().await;
        if state.trees.contains_key(&tree.id) {
            return Err(LibError::invalid(
                "Tree already exists",
                anyhow!("duplicate tree id {}", tree.id),
            ));
        }
        state.trees.insert(tree.id, tree.clone());
        Ok(tree)
    }

    async fn update_tree(
        &self,
        tree_id: TreeId,
        patch: TreePatch,
        expected_revision: Option<i64>,
    ) -> Result<Tree> {
        let mut state = self.state.lock().await;
        let tree = state
            .trees
            .get_mut(&tree_id)
            .ok_or_else(|| tree_not_found(tree_id))?;
        if let Some(expected) = expected_revision {
            if expected != tree.revision {
                return Err(LibError::conflict(
                    "Tree was modified concurrently",
                    anyhow!(
                        "tree {} has revision {}, expected {}",
                        tree_id,
                        tree.revision,
                        expected
                    ),
                ));
            }
        }

        if let Some(name) = patch.name {
            tree.name = name;
        }
        if let Some(private) = patch.private {
            tree.private = private;
        }
        if let Some(members) = patch.members {
            tree.members = members;
        }
        tree.revision += 1;
        Ok(tree.clone())
    }

    async fn delete_tree(&self, tree_id: TreeId) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .trees
            .remove(&tree_id)
            .map(|_| ())
            .ok_or_else(|| tree_not_found(tree_id))
    }

    async fn get_relative(&self, relative_id: RelativeId) -> Result<Relative> {
        self.state.lock().await.relative(relative_id).cloned()
    }

    async fn find_relatives(&self, filter: RelativeFilter) -> Result<Vec<Relative>> {
        let state = self.state.lock().await;
        let mut relatives = state
            .relatives
            .values()
            .filter(|relative| filter.matches(relative))
            .cloned()
            .collect::<Vec<_>>();
        relatives.sort_by(|a, b| {
            (&a.last_name, &a.first_name, a.id).cmp(&(&b.last_name, &b.first_name, b.id))
        });
        Ok(relatives)
    }

    async fn insert_relative(&self, relative: Relative) -> Result<Relative> {
        let mut state = self.state.lock().await;
        if state.relatives.contains_key(&relative.id) {
            return Err(LibError::invalid(
                "Relative already exists",
                anyhow!("duplicate relative id {}", relative.id),
            ));
        }
        state.relatives.insert(relative.id, relative.clone());
        Ok(relative)
    }

    async fn update_relative(
        &self,
        relative_id: RelativeId,
        patch: RelativePatch,
        expected_revision: Option<i64>,
    ) -> Result<Relative> {
        let mut state = self.state.lock().await;
        state.check_relative_revision(relative_id, expected_revision)?;
        state.apply_relative_patch(relative_id, patch)
    }

    async fn delete_relative(
        &self,
        relative_id: RelativeId,
        expected_revision: Option<i64>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_relative_revision(relative_id, expected_revision)?;
        state.relatives.remove(&relative_id);
        Ok(())
    }

    async fn commit(&self, writes: Vec<StoreWrite>) -> Result<()> {
        if !self.transactional {
            return Err(LibError::database(
                "Storage does not support transactions",
                anyhow!("commit of {} write(s) on non-transactional store", writes.len()),
            ));
        }

        let mut state = self.state.lock().await;
        for write in &writes {
            match write {
                StoreWrite::AssertTree { tree_id, revision } => {
                    let tree = state.tree(*tree_id)?;
                    if tree.revision != *revision {
                        return Err(LibError::conflict(
                            "Tree was modified concurrently",
                            anyhow!(
                                "tree {} has revision {}, expected {}",
                                tree_id,
                                tree.revision,
                                revision
                            ),
                        ));
                    }
                }
                StoreWrite::UpdateRelative {
                    relative_id,
                    expected_revision,
                    ..
                }
                | StoreWrite::DeleteRelative {
                    relative_id,
                    expected_revision,
                } => state.check_relative_revision(*relative_id, Some(*expected_revision))?,
            }
        }

        for write in writes {
            match write {
                StoreWrite::AssertTree { .. } => {}
                StoreWrite::UpdateRelative {
                    relative_id, patch, ..
                } => {
                    state.apply_relative_patch(relative_id, patch)?;
                }
                StoreWrite::DeleteRelative { relative_id, .. } => {
                    state.relatives.remove(&relative_id);
                }
            }
        }
        Ok(())
    }
}

fn tree_not_found(tree_id: TreeId) -> LibError {
    LibError::not_found("Tree not found", anyhow!("tree {} not found", tree_id))
}

fn relative_not_found(relative_id: RelativeId) -> LibError {
    LibError::not_found(
        "Relative not found",
        anyhow!("relative {} not found", relative_id),
    )
}
