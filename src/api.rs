use anyhow::anyhow;
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ErrorKind, LibError};
use crate::models::{
    CreateRelativePayload, CreateTreePayload, MemberRolePayload, RelationshipDatesPayload,
    RelationshipId, RelativeId, TreeId, UpdateRelativePayload, UpdateTreePayload, UserId,
};
use crate::operations::FamilyTreeOperations;
use crate::permissions::Role;
use crate::store::GraphStore;

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::InvalidInput
        | ErrorKind::InvalidRange
        | ErrorKind::OverlappingInterval
        | ErrorKind::AmbiguousOpenInterval
        | ErrorKind::SelfReference => StatusCode::BAD_REQUEST,
        ErrorKind::LastAdminViolation | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::StorageTimeout => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::PartialWriteFailure | ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Rejected input stays at debug; failures the caller cannot fix are raised louder.
pub fn log_level_for(err: &LibError) -> tracing::Level {
    if status_for(err.kind).is_server_error() {
        tracing::Level::ERROR
    } else if err.is_validation() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind);
        match log_level_for(&self.0) {
            tracing::Level::ERROR => {
                tracing::error!(kind = ?self.0.kind, error = %self.0.source, "family api request failed")
            }
            tracing::Level::DEBUG => {
                tracing::debug!(kind = ?self.0.kind, error = %self.0.source, "family api request rejected")
            }
            _ => tracing::info!(kind = ?self.0.kind, error = %self.0.source, "family api request refused"),
        }

        let body = json!({
            "errors": [self.0.public],
            "code": self.0.code,
            "details": self.0.details,
        });
        (status, Json(body)).into_response()
    }
}

/// Authenticated user id placed in the request extensions by the auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub UserId);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Caller>().copied().ok_or_else(|| {
            AppError(LibError::unauthenticated(
                "Authentication required",
                anyhow!("request carried no caller identity"),
            ))
        })
    }
}

pub trait FamilyTreeApp {
    type Store: GraphStore + 'static;

    fn operations(&self) -> FamilyTreeOperations<Self::Store>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberPayload {
    pub user_id: UserId,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRelationshipPayload {
    pub spouse_id: RelativeId,
    #[serde(flatten)]
    pub dates: RelationshipDatesPayload,
}

async fn list_trees_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let trees = app.operations().list_trees(actor).await?;
    Ok(Json(trees))
}

async fn create_tree_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Json(payload): Json<CreateTreePayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let tree = app.operations().create_tree(actor, payload).await?;
    Ok((StatusCode::CREATED, Json(tree)))
}

async fn get_tree_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path(tree_id): Path<TreeId>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let tree = app.operations().get_tree(actor, tree_id).await?;
    Ok(Json(tree))
}

async fn update_tree_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path(tree_id): Path<TreeId>,
    Json(payload): Json<UpdateTreePayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let tree = app
        .operations()
        .update_tree(actor, tree_id, payload)
        .await?;
    Ok(Json(tree))
}

async fn delete_tree_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path(tree_id): Path<TreeId>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    app.operations().delete_tree(actor, tree_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn audit_tree_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path(tree_id): Path<TreeId>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let violations = app.operations().audit_tree(actor, tree_id).await?;
    Ok(Json(violations))
}

async fn list_members_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path(tree_id): Path<TreeId>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let members = app.operations().list_members(actor, tree_id).await?;
    Ok(Json(members))
}

async fn add_member_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path(tree_id): Path<TreeId>,
    Json(payload): Json<AddMemberPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let members = app
        .operations()
        .add_member(actor, tree_id, payload.user_id, payload.role)
        .await?;
    Ok((StatusCode::CREATED, Json(members)))
}

async fn update_member_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, user_id)): Path<(TreeId, UserId)>,
    Json(payload): Json<MemberRolePayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let members = app
        .operations()
        .update_tree_membership(actor, tree_id, user_id, payload.role)
        .await?;
    Ok(Json(members))
}

async fn remove_member_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, user_id)): Path<(TreeId, UserId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let members = app
        .operations()
        .remove_member(actor, tree_id, user_id)
        .await?;
    Ok(Json(members))
}

async fn list_relatives_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path(tree_id): Path<TreeId>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let relatives = app.operations().list_relatives(actor, tree_id).await?;
    Ok(Json(relatives))
}

async fn create_relative_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path(tree_id): Path<TreeId>,
    Json(payload): Json<CreateRelativePayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let relative = app
        .operations()
        .create_relative(actor, tree_id, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(relative)))
}

async fn get_relative_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, relative_id)): Path<(TreeId, RelativeId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let relative = app
        .operations()
        .get_relative(actor, tree_id, relative_id)
        .await?;
    Ok(Json(relative))
}

async fn update_relative_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, relative_id)): Path<(TreeId, RelativeId)>,
    Json(payload): Json<UpdateRelativePayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let relative = app
        .operations()
        .update_relative(actor, tree_id, relative_id, payload)
        .await?;
    Ok(Json(relative))
}

async fn delete_relative_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, relative_id)): Path<(TreeId, RelativeId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    app.operations()
        .delete_relative(actor, tree_id, relative_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_children_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, relative_id)): Path<(TreeId, RelativeId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let children = app
        .operations()
        .get_children(actor, tree_id, relative_id)
        .await?;
    Ok(Json(children))
}

async fn add_child_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, parent_id, child_id)): Path<(TreeId, RelativeId, RelativeId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let parent = app
        .operations()
        .add_child(actor, tree_id, parent_id, child_id)
        .await?;
    Ok(Json(parent))
}

async fn remove_child_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, parent_id, child_id)): Path<(TreeId, RelativeId, RelativeId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    app.operations()
        .remove_child(actor, tree_id, parent_id, child_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_parents_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, relative_id)): Path<(TreeId, RelativeId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let parents = app
        .operations()
        .get_parents(actor, tree_id, relative_id)
        .await?;
    Ok(Json(parents))
}

async fn get_relationships_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, relative_id)): Path<(TreeId, RelativeId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let links = app
        .operations()
        .get_relationships(actor, tree_id, relative_id)
        .await?;
    Ok(Json(links))
}

async fn add_relationship_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, relative_id)): Path<(TreeId, RelativeId)>,
    Json(payload): Json<AddRelationshipPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let relationship = app
        .operations()
        .add_relationship(actor, tree_id, relative_id, payload.spouse_id, payload.dates)
        .await?;
    Ok((StatusCode::CREATED, Json(relationship)))
}

async fn update_relationship_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, relative_id, relationship_id)): Path<(TreeId, RelativeId, RelationshipId)>,
    Json(payload): Json<RelationshipDatesPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    let relationship = app
        .operations()
        .update_relationship(actor, tree_id, relative_id, relationship_id, payload)
        .await?;
    Ok(Json(relationship))
}

async fn remove_relationship_handler<S>(
    State(app): State<S>,
    Caller(actor): Caller,
    Path((tree_id, relative_id, relationship_id)): Path<(TreeId, RelativeId, RelationshipId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    app.operations()
        .remove_relationship(actor, tree_id, relative_id, relationship_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn routes<S>() -> Router<S>
where
    S: FamilyTreeApp + Clone + Send + Sync + 'static,
{
    tracing::info!("Registering route /tree [GET,POST]");
    tracing::info!("Registering route /tree/{{tree_id}} [GET,PATCH,DELETE]");
    tracing::info!("Registering route /tree/{{tree_id}}/audit [GET]");
    tracing::info!("Registering route /tree/{{tree_id}}/members [GET,POST]");
    tracing::info!("Registering route /tree/{{tree_id}}/members/{{user_id}} [PUT,DELETE]");
    tracing::info!("Registering route /tree/{{tree_id}}/relatives [GET,POST]");
    tracing::info!("Registering route /tree/{{tree_id}}/relatives/{{relative_id}} [GET,PATCH,DELETE]");
    tracing::info!("Registering route /tree/{{tree_id}}/relatives/{{relative_id}}/children [GET]");
    tracing::info!(
        "Registering route /tree/{{tree_id}}/relatives/{{relative_id}}/children/{{child_id}} [PUT,DELETE]"
    );
    tracing::info!("Registering route /tree/{{tree_id}}/relatives/{{relative_id}}/parents [GET]");
    tracing::info!(
        "Registering route /tree/{{tree_id}}/relatives/{{relative_id}}/relationships [GET,POST]"
    );
    tracing::info!(
        "Registering route /tree/{{tree_id}}/relatives/{{relative_id}}/relationships/{{relationship_id}} [PUT,DELETE]"
    );

    Router::new()
        .route(
            "/tree",
            get(list_trees_handler::<S>).post(create_tree_handler::<S>),
        )
        .route(
            "/tree/{tree_id}",
            get(get_tree_handler::<S>)
                .patch(update_tree_handler::<S>)
                .delete(delete_tree_handler::<S>),
        )
        .route("/tree/{tree_id}/audit", get(audit_tree_handler::<S>))
        .route(
            "/tree/{tree_id}/members",
            get(list_members_handler::<S>).post(add_member_handler::<S>),
        )
        .route(
            "/tree/{tree_id}/members/{user_id}",
            put(update_member_handler::<S>).delete(remove_member_handler::<S>),
        )
        .route(
            "/tree/{tree_id}/relatives",
            get(list_relatives_handler::<S>).post(create_relative_handler::<S>),
        )
        .route(
            "/tree/{tree_id}/relatives/{relative_id}",
            get(get_relative_handler::<S>)
                .patch(update_relative_handler::<S>)
                .delete(delete_relative_handler::<S>),
        )
        .route(
            "/tree/{tree_id}/relatives/{relative_id}/children",
            get(get_children_handler::<S>),
        )
        .route(
            "/tree/{tree_id}/relatives/{relative_id}/children/{child_id}",
            put(add_child_handler::<S>).delete(remove_child_handler::<S>),
        )
        .route(
            "/tree/{tree_id}/relatives/{relative_id}/parents",
            get(get_parents_handler::<S>),
        )
        .route(
            "/tree/{tree_id}/relatives/{relative_id}/relationships",
            get(get_relationships_handler::<S>).post(add_relationship_handler::<S>),
        )
        .route(
            "/tree/{tree_id}/relatives/{relative_id}/relationships/{relationship_id}",
            put(update_relationship_handler::<S>).delete(remove_relationship_handler::<S>),
        )
}
