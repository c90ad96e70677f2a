//! REST endpoints for client records and worker control.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error, info};

use super::{AppState, error_response, manager_error_response};
use crate::manager::{ClientId, StatusRecord};
use crate::store::{ClientRecord, ClientUpdate, DEFAULT_REFRESH_DELAY, NewClient};

/// Page size when `limit` is absent or zero.
const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;

/// A stored client with its live status.
#[derive(Serialize)]
pub struct ClientView {
    #[serde(flatten)]
    pub client: ClientRecord,
    pub status: StatusRecord,
}

/// Body of `POST /api/clients`. Required fields are optional here so a
/// missing one yields a 400 with a readable message.
#[derive(Deserialize)]
pub struct CreateClientRequest {
    name: Option<String>,
    email: Option<String>,
    password: Option<String>,
    country_code: Option<String>,
    schedule_id: Option<String>,
    facility_id: Option<String>,
    #[serde(default, deserialize_with = "optional_date")]
    current_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "optional_date")]
    target_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "optional_date")]
    min_date: Option<NaiveDate>,
    refresh_delay: Option<u64>,
}

impl CreateClientRequest {
    fn into_new_client(self) -> Option<NewClient> {
        fn present(value: Option<String>) -> Option<String> {
            value.filter(|v| !v.trim().is_empty())
        }

        Some(NewClient {
            name: present(self.name)?,
            email: present(self.email)?,
            password: SecretString::from(present(self.password)?),
            country_code: present(self.country_code)?,
            schedule_id: present(self.schedule_id)?,
            facility_id: present(self.facility_id)?,
            current_date: self.current_date?,
            target_date: self.target_date,
            min_date: self.min_date,
            refresh_delay: self
                .refresh_delay
                .filter(|d| *d > 0)
                .unwrap_or(DEFAULT_REFRESH_DELAY),
        })
    }
}

/// Body of `PUT /api/clients/{id}`. Absent fields are kept; an explicit
/// `null` (or empty string) clears the optional dates.
#[derive(Deserialize)]
pub struct UpdateClientRequest {
    name: Option<String>,
    email: Option<String>,
    password: Option<String>,
    country_code: Option<String>,
    schedule_id: Option<String>,
    facility_id: Option<String>,
    #[serde(default, deserialize_with = "optional_date")]
    current_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "present_optional_date")]
    target_date: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "present_optional_date")]
    min_date: Option<Option<NaiveDate>>,
    refresh_delay: Option<u64>,
}

impl From<UpdateClientRequest> for ClientUpdate {
    fn from(req: UpdateClientRequest) -> Self {
        ClientUpdate {
            name: req.name,
            email: req.email,
            // An empty password field means "unchanged".
            password: req
                .password
                .filter(|p| !p.is_empty())
                .map(SecretString::from),
            country_code: req.country_code,
            schedule_id: req.schedule_id,
            facility_id: req.facility_id,
            current_date: req.current_date,
            target_date: req.target_date,
            min_date: req.min_date,
            refresh_delay: req.refresh_delay.filter(|d| *d > 0),
        }
    }
}

/// `null`, `""` or a `YYYY-MM-DD` string.
fn optional_date<'de, D>(de: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Like [`optional_date`], but records that the field was present.
fn present_optional_date<'de, D>(de: D) -> Result<Option<Option<NaiveDate>>, D::Error>
where
    D: Deserializer<'de>,
{
    optional_date(de).map(Some)
}

#[derive(Deserialize)]
pub struct LogsQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

fn parse_id(raw: &str) -> Result<ClientId, Response> {
    raw.parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid client ID"))
}

fn internal(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "Request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Client not found")
}

pub async fn list_clients(State(state): State<AppState>) -> Response {
    let clients = match state.manager.store().list_clients().await {
        Ok(clients) => clients,
        Err(e) => return internal(e),
    };

    let mut views = Vec::with_capacity(clients.len());
    for client in clients {
        let status = state.manager.status(client.id).await;
        views.push(ClientView { client, status });
    }
    Json(views).into_response()
}

pub async fn get_client(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.manager.store().get_client(id).await {
        Ok(Some(client)) => {
            let status = state.manager.status(id).await;
            Json(ClientView { client, status }).into_response()
        }
        Ok(None) => not_found(),
        Err(e) => internal(e),
    }
}

pub async fn create_client(
    State(state): State<AppState>,
    Json(body): Json<CreateClientRequest>,
) -> Response {
    let Some(new_client) = body.into_new_client() else {
        return error_response(StatusCode::BAD_REQUEST, "Missing required fields");
    };

    match state.manager.store().insert_client(&new_client).await {
        Ok(client) => {
            info!(client_id = %client.id, name = %client.name, "Client created");
            let status = state.manager.status(client.id).await;
            (StatusCode::CREATED, Json(ClientView { client, status })).into_response()
        }
        Err(e) => internal(e),
    }
}

pub async fn update_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateClientRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    if state.manager.is_running(id).await {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Cannot update client while bot is running. Stop the bot first.",
        );
    }

    match state.manager.store().update_client(id, &body.into()).await {
        Ok(Some(client)) => {
            info!(client_id = %id, "Client updated");
            let status = state.manager.status(id).await;
            Json(ClientView { client, status }).into_response()
        }
        Ok(None) => not_found(),
        Err(e) => internal(e),
    }
}

pub async fn delete_client(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.manager.store().get_client(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(e) => return internal(e),
    }

    if state.manager.is_running(id).await {
        if let Err(e) = state.manager.stop(id).await {
            // The worker exited or was stopped since the check above.
            debug!(client_id = %id, error = %e, "Worker already down before delete");
        }
    }

    match state.manager.store().delete_client(id).await {
        Ok(true) => {
            state.manager.forget(id).await;
            info!(client_id = %id, "Client deleted");
            Json(serde_json::json!({ "message": "Client deleted successfully" })).into_response()
        }
        Ok(false) => not_found(),
        Err(e) => internal(e),
    }
}

pub async fn start_client(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.manager.start_client(id).await {
        Ok(()) => {
            let status = state.manager.status(id).await;
            Json(serde_json::json!({
                "message": "Bot started successfully",
                "status": status,
            }))
            .into_response()
        }
        Err(e) => manager_error_response(e),
    }
}

pub async fn stop_client(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.manager.stop(id).await {
        Ok(()) => {
            let status = state.manager.status(id).await;
            Json(serde_json::json!({
                "message": "Bot stopped successfully",
                "status": status,
            }))
            .into_response()
        }
        Err(e) => manager_error_response(e),
    }
}

pub async fn client_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let limit = query
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .min(MAX_LOG_LIMIT);
    let offset = query.offset.unwrap_or(0);

    match state.manager.recent_logs(id, limit, offset).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => internal(e),
    }
}
