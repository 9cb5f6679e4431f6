//! HTTP API: the snapshot endpoint.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use flowchart_core::GraphSnapshot;
use serde::Serialize;
use tower_http::cors::{self, CorsLayer};

use crate::store::{PersistenceError, SnapshotStore};

pub const SAVED_MESSAGE: &str = "Data saved successfully";
pub const GREETING: &str = "Hello, World!";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SnapshotStore>,
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl ToString) -> AppError {
        Self {
            status,
            error: message.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl From<PersistenceError> for AppError {
    fn from(value: PersistenceError) -> Self {
        log::error!("{value}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, value)
    }
}

impl From<JsonRejection> for AppError {
    fn from(value: JsonRejection) -> Self {
        log::warn!("Rejected snapshot body: {value}");
        Self::new(value.status(), value.body_text())
    }
}

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        // allow requests from any origin
        .allow_origin(cors::Any)
        .allow_headers(cors::Any);

    Router::new()
        .route("/data", get(get_data).post(post_data))
        .route("/", get(|| async { Json(GREETING) }))
        .with_state(state)
        .layer(cors)
}

async fn get_data(State(state): State<AppState>) -> AppResult<Json<GraphSnapshot>> {
    let snapshot = state.store.load_or_init().await?;
    Ok(Json(snapshot))
}

async fn post_data(
    State(state): State<AppState>,
    body: Result<Json<GraphSnapshot>, JsonRejection>,
) -> AppResult<Json<&'static str>> {
    let Json(snapshot) = body?;
    state.store.save(&snapshot).await?;
    log::info!(
        "Saved {} nodes, {} edges",
        snapshot.nodes.len(),
        snapshot.edges.len()
    );
    Ok(Json(SAVED_MESSAGE))
}
