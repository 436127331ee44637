use std::sync::Arc;

use anyhow::anyhow;
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{LibError, Result, is_storage_timeout};
use crate::models::{
    Attribute, Gender, Relationship, Relative, RelativeId, Tree, TreeId, TreeMember,
};
use crate::store::{GraphStore, RelativeFilter, RelativePatch, StoreWrite, TreeFilter, TreePatch};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_family_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[derive(Debug, Clone, FromRow)]
struct TreeRow {
    id: Uuid,
    name: String,
    private: bool,
    members: Json<Vec<TreeMember>>,
    revision: i64,
    created_at: chrono::NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct RelativeRow {
    id: Uuid,
    tree_id: Uuid,
    first_name: String,
    last_name: String,
    gender: String,
    birthdate: Option<chrono::NaiveDate>,
    deathdate: Option<chrono::NaiveDate>,
    attributes: Json<Vec<Attribute>>,
    children: Vec<Uuid>,
    parents: Vec<Uuid>,
    relationships: Json<Vec<Relationship>>,
    revision: i64,
    created_at: chrono::NaiveDateTime,
}

impl From<TreeRow> for Tree {
    fn from(value: TreeRow) -> Self {
        Self {
            id: TreeId(value.id),
            name: value.name,
            private: value.private,
            members: value.members.0,
            revision: value.revision,
            created_at: value.created_at,
        }
    }
}

impl TryFrom<RelativeRow> for Relative {
    type Error = LibError;

    fn try_from(value: RelativeRow) -> Result<Self> {
        let gender = Gender::from_db_value(&value.gender).ok_or_else(|| {
            LibError::database(
                "Stored relative is malformed",
                anyhow!("relative {} has unknown gender {:?}", value.id, value.gender),
            )
        })?;

        Ok(Self {
            id: RelativeId(value.id),
            tree_id: TreeId(value.tree_id),
            first_name: value.first_name,
            last_name: value.last_name,
            gender,
            birthdate: value.birthdate,
            deathdate: value.deathdate,
            attributes: value.attributes.0,
            children: value.children.into_iter().map(RelativeId).collect(),
            parents: value.parents.into_iter().map(RelativeId).collect(),
            relationships: value.relationships.0,
            revision: value.revision,
            created_at: value.created_at,
        })
    }
}

const TREE_COLUMNS: &str = "id, name, private, members, revision, created_at";
const RELATIVE_COLUMNS: &str = "id, tree_id, first_name, last_name, gender, birthdate, deathdate, \
     attributes, children, parents, relationships, revision, created_at";

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    if is_storage_timeout(&err) {
        return LibError::from(err);
    }
    LibError::database(public, anyhow!(err))
}

fn ids(values: &[RelativeId]) -> Vec<Uuid> {
    values.iter().map(|id| id.0).collect()
}

async fn tree_revision(conn: &mut PgConnection, tree_id: TreeId, lock: bool) -> Result<Option<i64>> {
    let query = if lock {
        "SELECT revision FROM family.trees WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT revision FROM family.trees WHERE id = $1"
    };
    let row: Option<(i64,)> = sqlx::query_as(query)
        .bind(tree_id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|err| db_err("Failed to query tree", err))?;
    Ok(row.map(|(revision,)| revision))
}

async fn relative_exists(conn: &mut PgConnection, relative_id: RelativeId) -> Result<bool> {
    let exists: (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS(
            SELECT 1
            FROM family.relatives
            WHERE id = $1
        )
        "#,
    )
    .bind(relative_id.0)
    .fetch_one(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to query relative", err))?;

    Ok(exists.0)
}

/// Tells a stale revision apart from a missing record after a conditional write matched nothing.
async fn missed_relative(conn: &mut PgConnection, relative_id: RelativeId) -> LibError {
    match relative_exists(conn, relative_id).await {
        Ok(true) => LibError::conflict(
            "Relative was modified concurrently",
            anyhow!("relative {} revision changed", relative_id),
        ),
        Ok(false) => relative_not_found(relative_id),
        Err(err) => err,
    }
}

async fn update_relative_row(
    conn: &mut PgConnection,
    relative_id: RelativeId,
    patch: RelativePatch,
    expected_revision: Option<i64>,
) -> Result<Relative> {
    let row = match patch {
        RelativePatch::Links(links) => {
            sqlx::query_as::<_, RelativeRow>(&format!(
                r#"
                UPDATE family.relatives
                SET children = $2,
                    parents = $3,
                    relationships = $4,
                    revision = revision + 1
                WHERE id = $1
                  AND ($5::bigint IS NULL OR revision = $5)
                RETURNING {RELATIVE_COLUMNS}
                "#
            ))
            .bind(relative_id.0)
            .bind(ids(&links.children))
            .bind(ids(&links.parents))
            .bind(Json(&links.relationships))
            .bind(expected_revision)
            .fetch_optional(&mut *conn)
            .await
        }
        RelativePatch::Profile(profile) => {
            sqlx::query_as::<_, RelativeRow>(&format!(
                r#"
                UPDATE family.relatives
                SET first_name = $2,
                    last_name = $3,
                    gender = $4,
                    birthdate = $5,
                    deathdate = $6,
                    attributes = $7,
                    revision = revision + 1
                WHERE id = $1
                  AND ($8::bigint IS NULL OR revision = $8)
                RETURNING {RELATIVE_COLUMNS}
                "#
            ))
            .bind(relative_id.0)
            .bind(&profile.first_name)
            .bind(&profile.last_name)
            .bind(profile.gender.as_db_value())
            .bind(profile.birthdate)
            .bind(profile.deathdate)
            .bind(Json(&profile.attributes))
            .bind(expected_revision)
            .fetch_optional(&mut *conn)
            .await
        }
    }
    .map_err(|err| db_err("Failed to update relative", err))?;

    match row {
        Some(row) => Relative::try_from(row),
        None => Err(missed_relative(conn, relative_id).await),
    }
}

async fn delete_relative_row(
    conn: &mut PgConnection,
    relative_id: RelativeId,
    expected_revision: Option<i64>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        DELETE FROM family.relatives
        WHERE id = $1
          AND ($2::bigint IS NULL OR revision = $2)
        "#,
    )
    .bind(relative_id.0)
    .bind(expected_revision)
    .execute(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to delete relative", err))?;

    if result.rows_affected() == 0 {
        return Err(missed_relative(conn, relative_id).await);
    }
    Ok(())
}

/// Postgres-backed [`GraphStore`]. Batches run inside one transaction.
#[derive(Debug, Clone)]
pub struct PgGraphStore {
    pool: Arc<PgPool>,
}

impl PgGraphStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|err| db_err("Failed to acquire connection", err))
    }
}

impl GraphStore for PgGraphStore {
    fn supports_transactions(&self) -> bool {
        true
    }

    async fn get_tree(&self, tree_id: TreeId) -> Result<Tree> {
        let row = sqlx::query_as::<_, TreeRow>(&format!(
            "SELECT {TREE_COLUMNS} FROM family.trees WHERE id = $1"
        ))
        .bind(tree_id.0)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|err| db_err("Failed to query tree", err))?;

        row.map(Tree::from).ok_or_else(|| tree_not_found(tree_id))
    }

    async fn find_trees(&self, filter: TreeFilter) -> Result<Vec<Tree>> {
        let rows = sqlx::query_as::<_, TreeRow>(&format!(
            r#"
            SELECT {TREE_COLUMNS}
            FROM family.trees
            WHERE $1::uuid IS NULL
               OR members @> jsonb_build_array(jsonb_build_object('userId', $1::uuid))
            ORDER BY created_at DESC, id ASC
            "#
        ))
        .bind(filter.member.map(|user_id| user_id.0))
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|err| db_err("Failed to list trees", err))?;

        Ok(rows.into_iter().map(Tree::from).collect())
    }

    async fn insert_tree(&self, tree: Tree) -> Result<Tree> {
        let row = sqlx::query_as::<_, TreeRow>(&format!(
            r#"
            INSERT INTO family.trees (id, name, private, members, revision, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {TREE_COLUMNS}
            "#
        ))
        .bind(tree.id.0)
        .bind(&tree.name)
        .bind(tree.private)
        .bind(Json(&tree.members))
        .bind(tree.revision)
        .bind(tree.created_at)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(|err| db_err("Failed to create tree", err))?;

        Ok(row.into())
    }

    async fn update_tree(
        &self,
        tree_id: TreeId,
        patch: TreePatch,
        expected_revision: Option<i64>,
    ) -> Result<Tree> {
        let row = sqlx::query_as::<_, TreeRow>(&format!(
            r#"
            UPDATE family.trees
            SET name = COALESCE($2, name),
                private = COALESCE($3, private),
                members = COALESCE($4, members),
                revision = revision + 1
            WHERE id = $1
              AND ($5::bigint IS NULL OR revision = $5)
            RETURNING {TREE_COLUMNS}
            "#
        ))
        .bind(tree_id.0)
        .bind(patch.name)
        .bind(patch.private)
        .bind(patch.members.map(Json))
        .bind(expected_revision)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|err| db_err("Failed to update tree", err))?;

        if let Some(row) = row {
            return Ok(row.into());
        }

        let mut conn = self.acquire().await?;
        match tree_revision(&mut conn, tree_id, false).await? {
            Some(revision) => Err(LibError::conflict(
                "Tree was modified concurrently",
                anyhow!(
                    "tree {} has revision {}, expected {:?}",
                    tree_id,
                    revision,
                    expected_revision
                ),
            )),
            None => Err(tree_not_found(tree_id)),
        }
    }

    async fn delete_tree(&self, tree_id: TreeId) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM family.trees
            WHERE id = $1
            "#,
        )
        .bind(tree_id.0)
        .execute(self.pool.as_ref())
        .await
        .map_err(|err| db_err("Failed to delete tree", err))?;

        if result.rows_affected() == 0 {
            return Err(tree_not_found(tree_id));
        }
        Ok(())
    }

    async fn get_relative(&self, relative_id: RelativeId) -> Result<Relative> {
        let row = sqlx::query_as::<_, RelativeRow>(&format!(
            "SELECT {RELATIVE_COLUMNS} FROM family.relatives WHERE id = $1"
        ))
        .bind(relative_id.0)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|err| db_err("Failed to query relative", err))?;

        match row {
            Some(row) => Relative::try_from(row),
            None => Err(relative_not_found(relative_id)),
        }
    }

    async fn find_relatives(&self, filter: RelativeFilter) -> Result<Vec<Relative>> {
        let rows = sqlx::query_as::<_, RelativeRow>(&format!(
            r#"
            SELECT {RELATIVE_COLUMNS}
            FROM family.relatives
            WHERE ($1::uuid IS NULL OR tree_id = $1)
              AND (
                  $2::uuid IS NULL
                  OR $2 = ANY(children)
                  OR $2 = ANY(parents)
                  OR relationships @> jsonb_build_array(jsonb_build_object('spouseId', $2::uuid))
              )
            ORDER BY last_name ASC, first_name ASC, id ASC
            "#
        ))
        .bind(filter.tree_id.map(|tree_id| tree_id.0))
        .bind(filter.references.map(|relative_id| relative_id.0))
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|err| db_err("Failed to list relatives", err))?;

        rows.into_iter().map(Relative::try_from).collect()
    }

    async fn insert_relative(&self, relative: Relative) -> Result<Relative> {
        let row = sqlx::query_as::<_, RelativeRow>(&format!(
            r#"
            INSERT INTO family.relatives (
                id,
                tree_id,
                first_name,
                last_name,
                gender,
                birthdate,
                deathdate,
                attributes,
                children,
                parents,
                relationships,
                revision,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {RELATIVE_COLUMNS}
            "#
        ))
        .bind(relative.id.0)
        .bind(relative.tree_id.0)
        .bind(&relative.first_name)
        .bind(&relative.last_name)
        .bind(relative.gender.as_db_value())
        .bind(relative.birthdate)
        .bind(relative.deathdate)
        .bind(Json(&relative.attributes))
        .bind(ids(&relative.children))
        .bind(ids(&relative.parents))
        .bind(Json(&relative.relationships))
        .bind(relative.revision)
        .bind(relative.created_at)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(|err| db_err("Failed to create relative", err))?;

        Relative::try_from(row)
    }

    async fn update_relative(
        &self,
        relative_id: RelativeId,
        patch: RelativePatch,
        expected_revision: Option<i64>,
    ) -> Result<Relative> {
        let mut conn = self.acquire().await?;
        update_relative_row(&mut conn, relative_id, patch, expected_revision).await
    }

    async fn delete_relative(
        &self,
        relative_id: RelativeId,
        expected_revision: Option<i64>,
    ) -> Result<()> {
        let mut conn = self.acquire().await?;
        delete_relative_row(&mut conn, relative_id, expected_revision).await
    }

    async fn commit(&self, writes: Vec<StoreWrite>) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;

        for write in writes {
            match write {
                StoreWrite::AssertTree { tree_id, revision } => {
                    match tree_revision(&mut tx, tree_id, true).await? {
                        Some(current) if current == revision => {}
                        Some(current) => {
                            return Err(LibError::conflict(
                                "Tree was modified concurrently",
                                anyhow!(
                                    "tree {} has revision {}, expected {}",
                                    tree_id,
                                    current,
                                    revision
                                ),
                            ));
                        }
                        None => return Err(tree_not_found(tree_id)),
                    }
                }
                StoreWrite::UpdateRelative {
                    relative_id,
                    expected_revision,
                    patch,
                } => {
                    update_relative_row(&mut tx, relative_id, patch, Some(expected_revision))
                        .await?;
                }
                StoreWrite::DeleteRelative {
                    relative_id,
                    expected_revision,
                } => {
                    delete_relative_row(&mut tx, relative_id, Some(expected_revision)).await?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;
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
