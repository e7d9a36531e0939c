//! In-memory control-plane state
//!
//! One [`MockState`] lives inside each mock server process. The server wraps
//! it in a single lock, so every method here assumes exclusive access.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{MockError, MockResult};

/// Config keys that are served from the lists endpoint instead of the
/// runtime config.
pub const LIST_FIELDS: &[&str] = &[
    "blockedIPAddresses",
    "allowedIPAddresses",
    "monitoredIpAddresses",
    "blockedUserAgents",
    "monitoredUserAgents",
    "userAgentDetails",
];

const CONFIG_UPDATED_AT: &str = "configUpdatedAt";
const DEFAULT_SERVICE_ID: i64 = 1;

/// Version marker returned by `GET /config`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigVersion {
    pub service_id: i64,
    pub config_updated_at: i64,
}

#[derive(Debug, Default)]
pub struct MockState {
    config: Map<String, Value>,
    lists: Map<String, Value>,
    config_updated_at: i64,
    events: Vec<Value>,
    server_down: bool,
    auth_token: Option<String>,
}

impl MockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the state from a start config file on disk.
    pub fn from_start_config(path: &Path) -> MockResult<Self> {
        if !path.exists() {
            return Err(MockError::StartConfigNotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)?;
        let config: Value = serde_json::from_str(&content)?;

        let mut state = Self::new();
        state.apply_config(config)?;
        info!("Loaded runtime config from {}", path.display());
        Ok(state)
    }

    /// Replace the runtime config, split out the list fields and bump the
    /// version. Returns the new `configUpdatedAt`.
    pub fn apply_config(&mut self, config: Value) -> MockResult<i64> {
        let Value::Object(mut config) = config else {
            return Err(MockError::InvalidConfig(
                "config must be a JSON object".to_string(),
            ));
        };

        let mut lists = Map::new();
        for field in LIST_FIELDS {
            if let Some(value) = config.remove(*field) {
                lists.insert((*field).to_string(), value);
            }
        }
        config.remove(CONFIG_UPDATED_AT);

        self.config = config;
        self.lists = lists;
        self.config_updated_at = self.next_version();
        Ok(self.config_updated_at)
    }

    /// Millisecond wall clock, forced past the previous version when two
    /// updates land in the same millisecond or the clock steps back.
    fn next_version(&self) -> i64 {
        Utc::now()
            .timestamp_millis()
            .max(self.config_updated_at + 1)
    }

    pub fn service_id(&self) -> i64 {
        self.config
            .get("serviceId")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_SERVICE_ID)
    }

    pub fn config_version(&self) -> ConfigVersion {
        ConfigVersion {
            service_id: self.service_id(),
            config_updated_at: self.config_updated_at,
        }
    }

    /// Runtime config as the agent sees it, list fields excluded.
    pub fn runtime_config(&self) -> Value {
        let mut config = self.config.clone();
        config.insert(
            CONFIG_UPDATED_AT.to_string(),
            Value::from(self.config_updated_at),
        );
        Value::Object(config)
    }

    pub fn lists_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("success".to_string(), Value::Bool(true));
        payload.insert("serviceId".to_string(), Value::from(self.service_id()));
        for (key, value) in &self.lists {
            payload.insert(key.clone(), value.clone());
        }
        Value::Object(payload)
    }

    /// Append an event. Empty bodies (`null`, `false`, `0`, `""`, `[]`,
    /// `{}`) are ignored.
    pub fn record_event(&mut self, event: Value) -> bool {
        if !is_truthy(&event) {
            return false;
        }
        self.events.push(event);
        true
    }

    pub fn events(&self) -> &[Value] {
        &self.events
    }

    pub fn set_down(&mut self, down: bool) {
        self.server_down = down;
    }

    pub fn is_down(&self) -> bool {
        self.server_down
    }

    /// Remember the credential from an `Authorization` header.
    pub fn capture_token(&mut self, header_value: &str) {
        let token = header_value
            .strip_prefix("Bearer ")
            .unwrap_or(header_value)
            .trim();
        if !token.is_empty() {
            self.auth_token = Some(token.to_string());
        }
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
