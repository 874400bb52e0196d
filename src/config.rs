//! Application configuration.

/// Daemon-wide configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the libSQL database file.
    pub db_path: String,
    /// Port for the read-only HTTP API.
    pub api_port: u16,
    /// Path to the YAML reply templates file.
    pub templates_path: String,
    /// Directory for the rolling log file.
    pub log_dir: String,
    /// Maximum rows a single retroactive merge may rewrite.
    pub merge_limit: u32,
}

impl AppConfig {
    /// Build config from `INBOXD_*` environment variables, with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_port = std::env::var("INBOXD_API_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.api_port);

        let merge_limit = std::env::var("INBOXD_MERGE_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.merge_limit);

        Self {
            db_path: std::env::var("INBOXD_DB_PATH").unwrap_or(defaults.db_path),
            api_port,
            templates_path: std::env::var("INBOXD_TEMPLATES").unwrap_or(defaults.templates_path),
            log_dir: std::env::var("INBOXD_LOG_DIR").unwrap_or(defaults.log_dir),
            merge_limit,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/inboxd.db".to_string(),
            api_port: 8080,
            templates_path: "./templates.yml".to_string(),
            log_dir: "./logs".to_string(),
            merge_limit: 500,
        }
    }
}
