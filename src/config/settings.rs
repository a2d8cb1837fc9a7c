use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub events: EventLogConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Total request timeout in seconds for credential/login calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Reconnect attempts before the connection becomes terminally failed
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Base reconnect delay in milliseconds; attempt n waits base * 2^n
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Samples retained per (car, metric) selection
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Historical messages replayed when attaching a telemetry channel
    #[serde(default = "default_rewind")]
    pub rewind: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventLogConfig {
    /// Race events retained, newest first
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Path of the JSON file holding the persisted session
    #[serde(default = "default_session_path")]
    pub path: String,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    2000
}

fn default_buffer_capacity() -> usize {
    60
}

fn default_rewind() -> u32 {
    20
}

fn default_event_capacity() -> usize {
    100
}

fn default_session_path() -> String {
    ".trackside/session.json".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("backend.base_url", default_base_url())?
            .set_default("backend.request_timeout_secs", default_request_timeout())?
            .set_default("connection.max_retry_attempts", default_max_retry_attempts())?
            .set_default("connection.base_backoff_ms", default_base_backoff_ms() as i64)?
            .set_default("telemetry.buffer_capacity", default_buffer_capacity() as i64)?
            .set_default("telemetry.rewind", default_rewind())?
            .set_default("events.capacity", default_event_capacity() as i64)?
            .set_default("session.path", default_session_path())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // TRACKSIDE_BACKEND__BASE_URL, TRACKSIDE_CONNECTION__MAX_RETRY_ATTEMPTS, etc.
            .add_source(
                Environment::with_prefix("TRACKSIDE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Join a path onto the backend base URL.
    pub fn backend_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.backend.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            rewind: default_rewind(),
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path: default_session_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.connection.max_retry_attempts, 5);
        assert_eq!(settings.connection.base_backoff_ms, 2000);
        assert_eq!(settings.telemetry.buffer_capacity, 60);
        assert_eq!(settings.telemetry.rewind, 20);
        assert_eq!(settings.events.capacity, 100);
    }

    #[test]
    fn test_backend_url_join() {
        let mut settings = Settings::default();
        settings.backend.base_url = "http://localhost:8000/".to_string();
        assert_eq!(
            settings.backend_url("/anonymous-token"),
            "http://localhost:8000/anonymous-token"
        );
        assert_eq!(settings.backend_url("token"), "http://localhost:8000/token");
    }
}
