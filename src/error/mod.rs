use thiserror::Error;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Connection is in the failed state; call reset() first")]
    Terminal,

    #[error("Not connected")]
    NotConnected,

    #[error("Channel error on '{channel}' (code {code}): {message}")]
    Channel {
        channel: String,
        code: u32,
        message: String,
    },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Backend request failed: {0}")]
    Backend(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RealtimeError {
    /// Numeric fault code for channel-scoped errors, if any.
    pub fn channel_code(&self) -> Option<u32> {
        match self {
            RealtimeError::Channel { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
