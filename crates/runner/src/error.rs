//! Error types for the server test harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Scenario not found: {0}")]
    ScenarioNotFound(String),

    #[error("Invalid scenario {name}: {reason}")]
    InvalidScenario { name: String, reason: String },

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Failed to spawn {what}: {reason}")]
    Spawn { what: String, reason: String },

    #[error("Pre-flight failed for {backend}: {reason}")]
    PreflightFailed { backend: String, reason: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
