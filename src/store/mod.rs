//! Persistence layer: SQLite-backed storage for client records and logs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ClientRecord, ClientUpdate, DEFAULT_REFRESH_DELAY, Database, NewClient};
