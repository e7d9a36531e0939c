//! Hosting backends for the web-serving process under test
//!
//! Every backend implements the same five-step lifecycle. The orchestrator
//! calls [`Backend::initialize`] once, [`Backend::process_scenario`] for each
//! scenario, [`Backend::pre_flight`] once with all scenarios, then
//! [`Backend::start_server`] per scenario and finally [`Backend::teardown`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::process::ProcessHandle;
use crate::scenario::PreparedScenario;

pub mod builtin;
pub mod frankenphp;
pub mod nginx;

pub use builtin::PhpBuiltInBackend;
pub use frankenphp::{FrankenPhpBackend, WorkerMode};
pub use nginx::NginxPhpFpmBackend;

/// Registry key for each backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Built-in interpreter server, one process per scenario
    PhpBuiltIn,
    /// Process-manager pools behind one shared reverse proxy
    NginxPhpFpm,
    /// Shared worker runtime serving scripts classically
    FrankenphpClassic,
    /// Shared worker runtime with long-lived dispatch scripts
    FrankenphpWorker,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::PhpBuiltIn,
        BackendKind::NginxPhpFpm,
        BackendKind::FrankenphpClassic,
        BackendKind::FrankenphpWorker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::PhpBuiltIn => "php-built-in",
            BackendKind::NginxPhpFpm => "nginx-php-fpm",
            BackendKind::FrankenphpClassic => "frankenphp-classic",
            BackendKind::FrankenphpWorker => "frankenphp-worker",
        }
    }

    /// Build the backend registered under this key.
    pub fn create(&self, config: &HarnessConfig) -> Arc<dyn Backend> {
        match self {
            BackendKind::PhpBuiltIn => Arc::new(PhpBuiltInBackend::new(config.php_built_in.clone())),
            BackendKind::NginxPhpFpm => Arc::new(NginxPhpFpmBackend::new(
                config.nginx_php_fpm.clone(),
                config.timing.poll_interval(),
            )),
            BackendKind::FrankenphpClassic => Arc::new(FrankenPhpBackend::new(
                WorkerMode::Classic,
                config.frankenphp.clone(),
                config.timing.poll_interval(),
                config.mock_sweep_pattern.clone(),
            )),
            BackendKind::FrankenphpWorker => Arc::new(FrankenPhpBackend::new(
                WorkerMode::Pooled,
                config.frankenphp.clone(),
                config.timing.poll_interval(),
                config.mock_sweep_pattern.clone(),
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| HarnessError::UnknownBackend(s.to_string()))
    }
}

/// Lifecycle every hosting backend provides
///
/// Defaults are no-ops so a backend only spells out the steps it needs.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// One-time setup before any scenario is prepared. Idempotent.
    async fn initialize(&self, _tests_root: &Path) -> HarnessResult<()> {
        Ok(())
    }

    /// Generate this scenario's backend artifacts. Writes only files keyed by
    /// the scenario.
    fn process_scenario(&self, scenario: PreparedScenario) -> HarnessResult<PreparedScenario> {
        Ok(scenario)
    }

    /// Global step after every scenario is prepared and before any runs.
    async fn pre_flight(&self, _scenarios: &[PreparedScenario]) -> HarnessResult<()> {
        Ok(())
    }

    /// Start the web-serving process for one scenario. Backends sharing one
    /// process across scenarios return `None`.
    async fn start_server(
        &self,
        scenario: &PreparedScenario,
        lib_dir: &Path,
        memory_checker: bool,
    ) -> HarnessResult<Option<ProcessHandle>>;

    /// Stop shared processes and remove generated artifacts.
    async fn teardown(&self) -> HarnessResult<()> {
        Ok(())
    }
}

/// Create `dir` and its parents if missing.
pub(crate) fn ensure_dir(dir: &Path) -> HarnessResult<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Remove everything inside `dir`, keeping the directory itself.
pub(crate) fn clear_dir(dir: &Path) -> HarnessResult<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

pub(crate) fn remove_file_if_exists(path: &Path) -> HarnessResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
