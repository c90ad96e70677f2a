//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::manager::{ClientId, LogEntry};
use crate::store::migrations;
use crate::store::traits::{ClientRecord, ClientUpdate, Database, NewClient};

const CLIENT_COLUMNS: &str = "id, name, email, password, country_code, schedule_id, facility_id, \
     current_booked_date, target_date, min_date, refresh_delay, created_at, updated_at";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format; lexical order matches chronological order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_date(column: &str, s: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| DatabaseError::Query(format!("Invalid {column} '{s}': {e}")))
}

fn opt_date(date: Option<NaiveDate>) -> libsql::Value {
    match date {
        Some(d) => libsql::Value::Text(d.format(DATE_FORMAT).to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a ClientRecord. Column order matches CLIENT_COLUMNS.
fn row_to_client(row: &libsql::Row) -> Result<ClientRecord, DatabaseError> {
    let get_text = |idx: i32| {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("client column {idx}: {e}")))
    };

    let current_date = parse_date("current_date", &get_text(7)?)?;
    let target_date = match row.get::<String>(8).ok() {
        Some(s) => Some(parse_date("target_date", &s)?),
        None => None,
    };
    let min_date = match row.get::<String>(9).ok() {
        Some(s) => Some(parse_date("min_date", &s)?),
        None => None,
    };
    let refresh_delay: i64 = row
        .get(10)
        .map_err(|e| DatabaseError::Query(format!("refresh_delay: {e}")))?;

    Ok(ClientRecord {
        id: ClientId(
            row.get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("client id: {e}")))?,
        ),
        name: get_text(1)?,
        email: get_text(2)?,
        password: SecretString::from(get_text(3)?),
        country_code: get_text(4)?,
        schedule_id: get_text(5)?,
        facility_id: get_text(6)?,
        current_date,
        target_date,
        min_date,
        refresh_delay: refresh_delay.max(0) as u64,
        created_at: parse_datetime(&get_text(11)?),
        updated_at: parse_datetime(&get_text(12)?),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<LogEntry, libsql::Error> {
    let id: i64 = row.get(0)?;
    let client_id: i64 = row.get(1)?;
    let message: String = row.get(2)?;
    let timestamp: String = row.get(3)?;
    Ok(LogEntry {
        id: Some(id),
        client_id: ClientId(client_id),
        message,
        timestamp: parse_datetime(&timestamp),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Clients ─────────────────────────────────────────────────────

    async fn insert_client(&self, client: &NewClient) -> Result<ClientRecord, DatabaseError> {
        let conn = self.conn();
        let now = format_timestamp(&Utc::now());

        let mut rows = conn
            .query(
                "INSERT INTO clients (name, email, password, country_code, schedule_id, facility_id,
                     current_booked_date, target_date, min_date, refresh_delay, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                 RETURNING id",
                params![
                    client.name.as_str(),
                    client.email.as_str(),
                    client.password.expose_secret(),
                    client.country_code.as_str(),
                    client.schedule_id.as_str(),
                    client.facility_id.as_str(),
                    client.current_date.format(DATE_FORMAT).to_string(),
                    opt_date(client.target_date),
                    opt_date(client.min_date),
                    client.refresh_delay as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_client: {e}")))?;

        let id: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("insert_client id: {e}")))?,
            Ok(None) => return Err(DatabaseError::Query("insert_client: no id returned".into())),
            Err(e) => return Err(DatabaseError::Query(format!("insert_client: {e}"))),
        };
        drop(rows);

        debug!(client_id = id, "Client inserted");

        self.get_client(ClientId(id))
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "client".into(),
                id: id.to_string(),
            })
    }

    async fn get_client(&self, id: ClientId) -> Result<Option<ClientRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
                params![id.0],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_client: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_client(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_client: {e}"))),
        }
    }

    async fn list_clients(&self) -> Result<Vec<ClientRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients ORDER BY created_at DESC, id DESC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_clients: {e}")))?;

        let mut clients = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_client(&row) {
                Ok(client) => clients.push(client),
                Err(e) => tracing::warn!("Skipping client row: {e}"),
            }
        }
        Ok(clients)
    }

    async fn list_client_ids(&self) -> Result<Vec<ClientId>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT id FROM clients ORDER BY id", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_client_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id) = row.get::<i64>(0) {
                ids.push(ClientId(id));
            }
        }
        Ok(ids)
    }

    async fn update_client(
        &self,
        id: ClientId,
        update: &ClientUpdate,
    ) -> Result<Option<ClientRecord>, DatabaseError> {
        let Some(existing) = self.get_client(id).await? else {
            return Ok(None);
        };

        let password = update
            .password
            .as_ref()
            .unwrap_or(&existing.password)
            .expose_secret()
            .to_string();
        let target_date = update.target_date.unwrap_or(existing.target_date);
        let min_date = update.min_date.unwrap_or(existing.min_date);
        let refresh_delay = update.refresh_delay.unwrap_or(existing.refresh_delay);

        self.conn()
            .execute(
                "UPDATE clients SET
                     name = ?1, email = ?2, password = ?3, country_code = ?4,
                     schedule_id = ?5, facility_id = ?6, current_booked_date = ?7,
                     target_date = ?8, min_date = ?9, refresh_delay = ?10, updated_at = ?11
                 WHERE id = ?12",
                params![
                    update.name.clone().unwrap_or(existing.name),
                    update.email.clone().unwrap_or(existing.email),
                    password,
                    update.country_code.clone().unwrap_or(existing.country_code),
                    update.schedule_id.clone().unwrap_or(existing.schedule_id),
                    update.facility_id.clone().unwrap_or(existing.facility_id),
                    update
                        .current_date
                        .unwrap_or(existing.current_date)
                        .format(DATE_FORMAT)
                        .to_string(),
                    opt_date(target_date),
                    opt_date(min_date),
                    refresh_delay as i64,
                    format_timestamp(&Utc::now()),
                    id.0,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_client: {e}")))?;

        self.get_client(id).await
    }

    async fn delete_client(&self, id: ClientId) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        conn.execute("DELETE FROM logs WHERE client_id = ?1", params![id.0])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_client logs: {e}")))?;

        let affected = conn
            .execute("DELETE FROM clients WHERE id = ?1", params![id.0])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_client: {e}")))?;

        Ok(affected > 0)
    }

    // ── Logs ────────────────────────────────────────────────────────

    async fn append_log(&self, entry: &LogEntry) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO logs (client_id, message, timestamp) VALUES (?1, ?2, ?3) RETURNING id",
                params![
                    entry.client_id.0,
                    entry.message.as_str(),
                    format_timestamp(&entry.timestamp),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_log: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("append_log id: {e}"))),
            Ok(None) => Err(DatabaseError::Query("append_log: no id returned".into())),
            Err(e) => Err(DatabaseError::Query(format!("append_log: {e}"))),
        }
    }

    async fn recent_logs(
        &self,
        client_id: ClientId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, client_id, message, timestamp FROM logs
                 WHERE client_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
                params![client_id.0, limit as i64, offset as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_log(&row) {
                Ok(entry) => logs.push(entry),
                Err(e) => tracing::warn!("Skipping log row: {e}"),
            }
        }
        Ok(logs)
    }
}
