//! Status, log, and broadcast envelope types shared by the manager and observers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a client record owned by the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub i64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ClientId)
    }
}

impl From<i64> for ClientId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// The most recent log line seen for a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastLog {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Best-known state of one client's worker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusRecord {
    pub running: bool,
    #[serde(rename = "lastLog")]
    pub last_log: Option<LastLog>,
}

/// A persisted log line. `id` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub client_id: ClientId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Create an unsaved entry stamped with the current time.
    pub fn new(client_id: ClientId, message: impl Into<String>) -> Self {
        Self {
            id: None,
            client_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn last_log(&self) -> LastLog {
        LastLog {
            message: self.message.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Messages pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Full snapshot, sent once when an observer connects.
    InitialStatus { data: BTreeMap<ClientId, StatusRecord> },
    /// One client's status changed.
    Status {
        #[serde(rename = "clientId")]
        client_id: ClientId,
        data: StatusRecord,
    },
    /// A new log line was recorded.
    Log {
        #[serde(rename = "clientId")]
        client_id: ClientId,
        data: LogEntry,
    },
}

impl WsMessage {
    /// Client the message refers to, if it is not a snapshot.
    pub fn client_id(&self) -> Option<ClientId> {
        match self {
            Self::InitialStatus { .. } => None,
            Self::Status { client_id, .. } | Self::Log { client_id, .. } => Some(*client_id),
        }
    }
}
