mod settings;

pub use settings::{
    BackendConfig, ConnectionConfig, EventLogConfig, SessionConfig, Settings, TelemetryConfig,
};
