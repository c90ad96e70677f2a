//! HTTP surface: observer WebSocket, client REST endpoints, static UI.

pub mod clients;
pub mod ws;

use std::path::Path;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::error::ManagerError;
use crate::manager::WorkerManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: WorkerManager,
}

/// Build the router. Static assets are served at `/` when a directory is given.
pub fn router(manager: WorkerManager, static_dir: Option<&Path>) -> Router {
    let state = AppState { manager };

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .route(
            "/api/clients",
            get(clients::list_clients).post(clients::create_client),
        )
        .route(
            "/api/clients/{id}",
            get(clients::get_client)
                .put(clients::update_client)
                .delete(clients::delete_client),
        )
        .route("/api/clients/{id}/start", post(clients::start_client))
        .route("/api/clients/{id}/stop", post(clients::stop_client))
        .route("/api/clients/{id}/logs", get(clients::client_logs))
        .with_state(state)
        .layer(CorsLayer::permissive());

    match static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `{"error": message}` with the given status.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Map lifecycle errors onto HTTP status codes.
pub(crate) fn manager_error_response(err: ManagerError) -> Response {
    let status = match &err {
        ManagerError::ClientNotFound(_) => StatusCode::NOT_FOUND,
        ManagerError::AlreadyRunning(_)
        | ManagerError::NotRunning(_)
        | ManagerError::SpawnFailure { .. } => StatusCode::BAD_REQUEST,
        ManagerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}
