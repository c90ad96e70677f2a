//! Error types for the slot watcher.

use crate::manager::ClientId;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Caller-facing lifecycle errors returned synchronously by start/stop.
///
/// Everything that goes wrong after a worker is running is reported through
/// the log stream instead.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Bot for client {0} is already running")]
    AlreadyRunning(ClientId),

    #[error("Bot for client {0} is not running")]
    NotRunning(ClientId),

    #[error("Failed to spawn bot for client {client_id}: {reason}")]
    SpawnFailure { client_id: ClientId, reason: String },

    #[error("Client {0} not found")]
    ClientNotFound(ClientId),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Failures raised inside the worker loop.
///
/// The loop never returns these; it classifies them and retries.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response from scheduling service: {0}")]
    InvalidResponse(String),

    #[error("Session rejected: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
