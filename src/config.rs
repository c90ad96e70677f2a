//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default HTTP/WebSocket port.
pub const DEFAULT_PORT: u16 = 3001;

/// Default wait after a transient connectivity failure.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3600);

/// Default seconds between availability checks.
pub const DEFAULT_REFRESH_DELAY_SECS: u64 = 3;

/// Hosting service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Worker executable.
    pub worker_bin: PathBuf,
    /// Optional directory of static UI assets served at `/`.
    pub static_dir: Option<PathBuf>,
    /// Forward `--dry-run` to every worker.
    pub dry_run: bool,
    /// `RUST_LOG` filter handed to workers.
    pub worker_log_filter: Option<String>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = match lookup("SLOT_WATCHER_PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "SLOT_WATCHER_PORT".into(),
                message: format!("'{raw}' is not a valid port"),
            })?,
            None => DEFAULT_PORT,
        };

        let db_path = lookup("SLOT_WATCHER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/slot-watcher.db"));

        let worker_bin = match lookup("SLOT_WATCHER_WORKER_BIN") {
            Some(path) => PathBuf::from(path),
            None => default_worker_bin()?,
        };

        let static_dir = lookup("SLOT_WATCHER_STATIC_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let dry_run = lookup("SLOT_WATCHER_DRY_RUN")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        let worker_log_filter = lookup("SLOT_WATCHER_WORKER_LOG").filter(|s| !s.trim().is_empty());

        Ok(Self {
            port,
            db_path,
            worker_bin,
            static_dir,
            dry_run,
            worker_log_filter,
        })
    }
}

/// `slot-worker` in the same directory as the running executable.
fn default_worker_bin() -> Result<PathBuf, ConfigError> {
    let exe = std::env::current_exe()?;
    Ok(exe.with_file_name(format!("slot-worker{}", std::env::consts::EXE_SUFFIX)))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Worker settings read from its isolated environment.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub email: String,
    pub password: SecretString,
    pub country_code: String,
    pub schedule_id: String,
    pub facility_id: String,
    pub refresh_delay: Duration,
    /// Base URL of the external scheduling service.
    pub api_url: String,
    pub cooldown: Duration,
}

impl WorkerEnv {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };
        let seconds = |key: &str, default: u64| -> Result<u64, ConfigError> {
            match lookup(key) {
                Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{raw}' is not a whole number of seconds"),
                }),
                None => Ok(default),
            }
        };

        Ok(Self {
            email: required("EMAIL")?,
            password: SecretString::from(required("PASSWORD")?),
            country_code: required("COUNTRY_CODE")?,
            schedule_id: required("SCHEDULE_ID")?,
            facility_id: required("FACILITY_ID")?,
            refresh_delay: Duration::from_secs(seconds(
                "REFRESH_DELAY",
                DEFAULT_REFRESH_DELAY_SECS,
            )?),
            api_url: required("SCHEDULING_API_URL")?,
            cooldown: Duration::from_secs(seconds(
                "SLOT_WORKER_COOLDOWN_SECS",
                DEFAULT_COOLDOWN.as_secs(),
            )?),
        })
    }
}
