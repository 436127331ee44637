use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use family_graph::api::{Caller, FamilyTreeApp};
use family_graph::db::PgGraphStore;
use family_graph::models::UserId;
use family_graph::operations::{CoordinatorConfig, FamilyTreeOperations};

#[derive(Clone)]
struct DevAuthConfig {
    default_user_id: Uuid,
    require_dev_header: bool,
}

#[derive(Clone)]
struct DemoApp {
    operations: FamilyTreeOperations<PgGraphStore>,
    auth: DevAuthConfig,
}

impl FamilyTreeApp for DemoApp {
    type Store = PgGraphStore;

    fn operations(&self) -> FamilyTreeOperations<PgGraphStore> {
        self.operations.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url = env::var("DATABASE_URL")
        .context("DATABASE_URL is required to run demos/family_api_server.rs")?;
    let bind = env::var("FAMILY_GRAPH_BIND").unwrap_or_else(|_| "127.0.0.1:4020".to_string());
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid FAMILY_GRAPH_BIND '{}'", bind))?;

    let default_user_id = env::var("FAMILY_GRAPH_DEFAULT_USER_ID")
        .unwrap_or_else(|_| "00000000-0000-0000-0000-000000000001".to_string());
    let default_user_id = Uuid::parse_str(&default_user_id).with_context(|| {
        format!(
            "invalid FAMILY_GRAPH_DEFAULT_USER_ID '{}'",
            default_user_id
        )
    })?;
    let auth = DevAuthConfig {
        default_user_id,
        require_dev_header: env_flag("FAMILY_GRAPH_REQUIRE_DEV_HEADER"),
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;
    family_graph::db::create_family_tables(&pool)
        .await
        .context("failed to run family graph migrations")?;

    let store = PgGraphStore::new(Arc::new(pool));
    let app_state = DemoApp {
        operations: FamilyTreeOperations::with_config(
            Arc::new(store),
            CoordinatorConfig::from_env(),
        ),
        auth,
    };

    let api_v1 = Router::new()
        .route("/healthz", get(health_handler))
        .route("/demo/whoami", get(whoami_handler))
        .merge(family_graph::api::routes::<DemoApp>());

    let app = Router::new()
        .nest("/api/v1", api_v1)
        .layer(from_fn_with_state(
            app_state.clone(),
            dev_identity_middleware,
        ))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;

    tracing::info!(%bind_addr, "family graph demo server listening");
    tracing::info!("api base path: /api/v1");
    tracing::info!("auth shim header: x-dev-user-id");
    tracing::info!("set FAMILY_GRAPH_REQUIRE_DEV_HEADER=true to require x-dev-user-id");

    axum::serve(listener, app)
        .await
        .context("demo server failed")
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => {
            let normalized = value.trim().to_ascii_lowercase();
            normalized == "1" || normalized == "true" || normalized == "yes"
        }
        Err(_) => false,
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true
    }))
}

async fn whoami_handler(Caller(user_id): Caller) -> Json<serde_json::Value> {
    Json(json!({
        "userId": user_id.to_string(),
    }))
}

async fn dev_identity_middleware(
    State(app): State<DemoApp>,
    mut req: Request,
    next: Next,
) -> Response {
    let user_id = match parse_user_id(req.headers(), &app.auth) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    req.extensions_mut().insert(Caller(user_id));
    next.run(req).await
}

fn parse_user_id(headers: &HeaderMap, auth: &DevAuthConfig) -> Result<UserId, Response> {
    let Some(raw_user_id) = headers
        .get("x-dev-user-id")
        .and_then(|value| value.to_str().ok())
    else {
        if auth.require_dev_header {
            return Err(json_error(
                StatusCode::UNAUTHORIZED,
                "missing_dev_user_id",
                "x-dev-user-id header is required",
            ));
        }
        return Ok(UserId(auth.default_user_id));
    };

    Uuid::parse_str(raw_user_id).map(UserId).map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_dev_user_id",
            "invalid UUID",
        )
    })
}

fn json_error(status: StatusCode, code: &'static str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "errors": [message],
            "code": code,
        })),
    )
        .into_response()
}
