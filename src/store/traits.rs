//! `Database` trait: single async interface for client records and logs.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use secrecy::SecretString;
use serde::Serialize;

use crate::error::DatabaseError;
use crate::manager::{ClientId, LogEntry};

/// Default poll interval in seconds for new clients.
pub const DEFAULT_REFRESH_DELAY: u64 = 3;

/// A watched client account, as stored.
#[derive(Debug, Clone, Serialize)]
pub struct ClientRecord {
    pub id: ClientId,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: SecretString,
    pub country_code: String,
    pub schedule_id: String,
    pub facility_id: String,
    pub current_date: NaiveDate,
    pub target_date: Option<NaiveDate>,
    pub min_date: Option<NaiveDate>,
    /// Seconds between availability checks.
    pub refresh_delay: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new client record.
#[derive(Debug, Clone)]
pub struct NewClient {
    pub name: String,
    pub email: String,
    pub password: SecretString,
    pub country_code: String,
    pub schedule_id: String,
    pub facility_id: String,
    pub current_date: NaiveDate,
    pub target_date: Option<NaiveDate>,
    pub min_date: Option<NaiveDate>,
    pub refresh_delay: u64,
}

/// Partial update. `None` keeps the stored value; for the optional dates,
/// `Some(None)` clears them.
#[derive(Debug, Clone, Default)]
pub struct ClientUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<SecretString>,
    pub country_code: Option<String>,
    pub schedule_id: Option<String>,
    pub facility_id: Option<String>,
    pub current_date: Option<NaiveDate>,
    pub target_date: Option<Option<NaiveDate>>,
    pub min_date: Option<Option<NaiveDate>>,
    pub refresh_delay: Option<u64>,
}

/// Backend-agnostic persistence for the record store and the log store.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Clients ─────────────────────────────────────────────────────

    /// Insert a client and return the stored record.
    async fn insert_client(&self, client: &NewClient) -> Result<ClientRecord, DatabaseError>;

    async fn get_client(&self, id: ClientId) -> Result<Option<ClientRecord>, DatabaseError>;

    /// All clients, newest first.
    async fn list_clients(&self) -> Result<Vec<ClientRecord>, DatabaseError>;

    async fn list_client_ids(&self) -> Result<Vec<ClientId>, DatabaseError>;

    /// Apply a partial update. Returns `None` if the client does not exist.
    async fn update_client(
        &self,
        id: ClientId,
        update: &ClientUpdate,
    ) -> Result<Option<ClientRecord>, DatabaseError>;

    /// Delete a client together with its logs. Returns whether it existed.
    async fn delete_client(&self, id: ClientId) -> Result<bool, DatabaseError>;

    // ── Logs ────────────────────────────────────────────────────────

    /// Append a log entry. Returns the assigned row id.
    async fn append_log(&self, entry: &LogEntry) -> Result<i64, DatabaseError>;

    /// Logs for a client, newest first.
    async fn recent_logs(
        &self,
        client_id: ClientId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LogEntry>, DatabaseError>;
}
