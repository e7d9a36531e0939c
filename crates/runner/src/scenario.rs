//! Scenario discovery and per-scenario records

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::backend::BackendKind;
use crate::config::AgentConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::ports::PortPair;

pub const START_CONFIG_FILE: &str = "start_config.json";
pub const ENV_FILE: &str = "env.json";

/// One test directory, as discovered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Directory name, unique within the suite
    pub name: String,

    /// Scenario directory, also the web root
    pub dir: PathBuf,

    /// Config preloaded into the mock server
    pub start_config: PathBuf,

    /// Optional environment overrides for the web-serving process
    pub env_file: PathBuf,

    pub backend: BackendKind,
}

impl ScenarioSpec {
    /// Describe the scenario living in `dir`.
    pub fn from_dir(dir: &Path, backend: BackendKind) -> HarnessResult<Self> {
        if !dir.is_dir() {
            return Err(HarnessError::ScenarioNotFound(dir.display().to_string()));
        }

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| HarnessError::ScenarioNotFound(dir.display().to_string()))?;

        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            start_config: dir.join(START_CONFIG_FILE),
            env_file: dir.join(ENV_FILE),
            backend,
        })
    }

    /// Every direct subdirectory of `root` is a scenario. Sorted by name.
    pub fn discover(root: &Path, backend: BackendKind) -> HarnessResult<Vec<Self>> {
        let mut specs = Vec::new();

        for entry in walkdir::WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| HarnessError::Io(e.into()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            specs.push(Self::from_dir(entry.path(), backend)?);
        }

        Ok(specs)
    }

    /// Overrides from the scenario's env file; empty when it does not exist.
    pub fn env_overrides(&self) -> HarnessResult<BTreeMap<String, String>> {
        if !self.env_file.exists() {
            return Ok(BTreeMap::new());
        }

        let content = std::fs::read_to_string(&self.env_file)?;
        let Value::Object(vars) = serde_json::from_str::<Value>(&content)? else {
            return Err(HarnessError::InvalidScenario {
                name: self.name.clone(),
                reason: format!("{} must hold a JSON object", ENV_FILE),
            });
        };

        Ok(vars
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect())
    }

    /// Environment for the web-serving process: scenario overrides, then the
    /// agent settings pointing at this scenario's mock server.
    pub fn server_env(
        &self,
        agent: &AgentConfig,
        mock_port: u16,
    ) -> HarnessResult<BTreeMap<String, String>> {
        let mut env = self.env_overrides()?;
        let mock_url = format!("http://{}:{}/", agent.mock_host, mock_port);
        env.insert("AIKIDO_LOG_LEVEL".to_string(), agent.log_level.clone());
        env.insert("AIKIDO_TOKEN".to_string(), agent.token.clone());
        env.insert("AIKIDO_ENDPOINT".to_string(), mock_url.clone());
        env.insert("AIKIDO_CONFIG_ENDPOINT".to_string(), mock_url);
        Ok(env)
    }
}

/// Files a backend generated for one scenario
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioArtifacts {
    /// Site definition merged into a shared server config
    pub site_block: Option<String>,

    /// Per-scenario process-manager pool definition
    pub pool_config: Option<PathBuf>,

    /// Generated request-dispatch script
    pub worker_script: Option<PathBuf>,
}

/// A scenario with its ports leased and its backend artifacts generated
#[derive(Debug)]
pub struct PreparedScenario {
    pub spec: ScenarioSpec,
    pub ports: PortPair,
    pub env: BTreeMap<String, String>,
    pub artifacts: ScenarioArtifacts,
}

impl PreparedScenario {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn server_port(&self) -> u16 {
        self.ports.server.port()
    }

    pub fn mock_port(&self) -> u16 {
        self.ports.mock.port()
    }
}

/// Terminal outcome of a scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed { reason: String },
}

impl Outcome {
    pub const TIMEOUT: &'static str = "Timeout";

    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::failed(Self::TIMEOUT)
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }
}

/// Result of running a single scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
}
