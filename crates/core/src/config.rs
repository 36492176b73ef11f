//! Environment-driven configuration.
//!
//! All settings are read from `SCHEDULE_TASK_*` environment variables with
//! sensible defaults, so the server runs with zero configuration when
//! launched by an MCP host.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Default sampling round-trip timeout (3 minutes).
pub const DEFAULT_SAMPLING_TIMEOUT_MS: u64 = 180_000;

// ── Config ───────────────────────────────────────────────────────────

/// Runtime configuration, resolved once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// IANA timezone name, if one was requested via the environment.
    pub timezone: Option<String>,
    /// How long a fire waits for the peer's sampling response.
    pub sampling_timeout: Duration,
    /// Explicit legacy task-file location, if overridden.
    legacy_path: Option<PathBuf>,
}

impl Config {
    /// Build config from environment variables (call [`load_dotenv`] first).
    pub fn from_env() -> Self {
        let db_path = env_opt("SCHEDULE_TASK_DB_PATH")
            .map(|p| normalize_db_path(Path::new(&p)))
            .unwrap_or_else(default_db_path);

        let timezone = env_opt("SCHEDULE_TASK_TIMEZONE");

        let sampling_timeout_ms = match env_opt("SCHEDULE_TASK_SAMPLING_TIMEOUT") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => ms,
                _ => {
                    warn!(value = %raw, "invalid SCHEDULE_TASK_SAMPLING_TIMEOUT, using default");
                    DEFAULT_SAMPLING_TIMEOUT_MS
                }
            },
            None => DEFAULT_SAMPLING_TIMEOUT_MS,
        };

        let legacy_path = env_opt("SCHEDULE_TASK_LEGACY_PATH").map(PathBuf::from);

        Self {
            db_path,
            timezone,
            sampling_timeout: Duration::from_millis(sampling_timeout_ms),
            legacy_path,
        }
    }

    /// Location of the legacy free-form task file considered for one-shot
    /// import: the explicit override, or `tasks.json` next to the database.
    pub fn legacy_file(&self) -> PathBuf {
        match &self.legacy_path {
            Some(p) => p.clone(),
            None => self
                .db_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("tasks.json"),
        }
    }

    /// Log the resolved configuration at startup.
    pub fn log_summary(&self) {
        tracing::info!(
            db_path = %self.db_path.display(),
            timezone = %self.timezone.as_deref().unwrap_or("(host)"),
            sampling_timeout_ms = self.sampling_timeout.as_millis() as u64,
            "configuration loaded"
        );
    }
}

/// Default database location: `<home>/.schedule-task-mcp/tasks.db`.
fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".schedule-task-mcp")
        .join("tasks.db")
}

/// Normalize a user-supplied database path.
///
/// A `.json` suffix (a leftover from the file-based layout) is rewritten to
/// `.db`; a path with no extension gets `.db` appended.
fn normalize_db_path(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => path.with_extension("db"),
        Some(_) => path.to_path_buf(),
        None => path.with_extension("db"),
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_db_path_json_rewritten() {
        let p = normalize_db_path(Path::new("/data/tasks.json"));
        assert_eq!(p, PathBuf::from("/data/tasks.db"));
    }

    #[test]
    fn test_normalize_db_path_no_extension() {
        let p = normalize_db_path(Path::new("/data/tasks"));
        assert_eq!(p, PathBuf::from("/data/tasks.db"));
    }

    #[test]
    fn test_normalize_db_path_db_kept() {
        let p = normalize_db_path(Path::new("/data/tasks.db"));
        assert_eq!(p, PathBuf::from("/data/tasks.db"));
    }

    #[test]
    fn test_normalize_db_path_other_extension_kept() {
        let p = normalize_db_path(Path::new("/data/tasks.sqlite"));
        assert_eq!(p, PathBuf::from("/data/tasks.sqlite"));
    }

    #[test]
    fn test_legacy_file_sits_next_to_db() {
        let config = Config {
            db_path: PathBuf::from("/data/store/tasks.db"),
            timezone: None,
            sampling_timeout: Duration::from_millis(DEFAULT_SAMPLING_TIMEOUT_MS),
            legacy_path: None,
        };
        assert_eq!(config.legacy_file(), PathBuf::from("/data/store/tasks.json"));
    }

    #[test]
    fn test_legacy_file_override() {
        let config = Config {
            db_path: PathBuf::from("/data/tasks.db"),
            timezone: None,
            sampling_timeout: Duration::from_millis(50),
            legacy_path: Some(PathBuf::from("/elsewhere/old-tasks.json")),
        };
        assert_eq!(config.legacy_file(), PathBuf::from("/elsewhere/old-tasks.json"));
    }
}
