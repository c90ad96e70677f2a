//! Slot Watcher: supervises per-client slot-watching worker processes and
//! streams their progress to observers.

pub mod api;
pub mod config;
pub mod error;
pub mod manager;
pub mod store;
pub mod watcher;
