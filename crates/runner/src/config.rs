//! Harness configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};

const MOCK_BINARY_NAME: &str = "mock-core";

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Command that starts a mock control-plane server. The mock port and the
    /// start config path are appended as the last two arguments.
    pub mock_command: Vec<String>,

    /// Command-line pattern matching stray mock servers from earlier runs.
    /// Empty disables the sweep.
    pub mock_sweep_pattern: String,

    /// Maximum number of scenarios running at once
    pub max_parallel: usize,

    /// Assertion script settings
    pub script: ScriptConfig,

    /// Grace delays and deadlines
    pub timing: TimingConfig,

    /// Agent settings injected into the web-serving process
    pub agent: AgentConfig,

    pub php_built_in: BuiltInConfig,
    pub nginx_php_fpm: FpmProxyConfig,
    pub frankenphp: FrankenPhpConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mock_command: vec![default_mock_binary()],
            mock_sweep_pattern: MOCK_BINARY_NAME.to_string(),
            max_parallel: 16,
            script: ScriptConfig::default(),
            timing: TimingConfig::default(),
            agent: AgentConfig::default(),
            php_built_in: BuiltInConfig::default(),
            nginx_php_fpm: FpmProxyConfig::default(),
            frankenphp: FrankenPhpConfig::default(),
        }
    }
}

/// Prefer the mock binary shipped next to the running executable, fall back
/// to a `PATH` lookup.
fn default_mock_binary() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(MOCK_BINARY_NAME)))
        .filter(|candidate| candidate.exists())
        .map(|candidate| candidate.to_string_lossy().to_string())
        .unwrap_or_else(|| MOCK_BINARY_NAME.to_string())
}

/// How the runner decides a freshly spawned process is ready
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Sleep for the whole grace period
    #[default]
    FixedDelay,
    /// Poll the port until it accepts connections, bounded by the grace period
    Probe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Interpreter used to run assertion scripts
    pub interpreter: String,

    /// Script run from each scenario directory
    pub test_script: String,

    /// Script run from the suite root in benchmark mode
    pub benchmark_script: String,

    /// Environment variable the test library directory is prepended to
    pub lib_path_var: String,

    /// Wall-clock deadline per script
    pub timeout_secs: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            test_script: "test.py".to_string(),
            benchmark_script: "benchmark.py".to_string(),
            lib_path_var: "PYTHONPATH".to_string(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Grace period after spawning the mock server
    pub mock_grace_ms: u64,

    /// Grace period after starting the web-serving process
    pub server_grace_ms: u64,

    /// Time between SIGTERM and SIGKILL during teardown
    pub kill_grace_ms: u64,

    pub readiness: Readiness,

    /// Poll interval for readiness probes and process-presence checks
    pub poll_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            mock_grace_ms: 5_000,
            server_grace_ms: 5_000,
            kill_grace_ms: 5_000,
            readiness: Readiness::FixedDelay,
            poll_interval_ms: 100,
        }
    }
}

impl TimingConfig {
    pub fn mock_grace(&self) -> Duration {
        Duration::from_millis(self.mock_grace_ms)
    }

    pub fn server_grace(&self) -> Duration {
        Duration::from_millis(self.server_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub token: String,
    pub log_level: String,

    /// Host name the agent uses to reach the mock server
    pub mock_host: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            token: "AIK_RUNTIME_MOCK".to_string(),
            log_level: "DEBUG".to_string(),
            mock_host: "localhost".to_string(),
        }
    }
}

/// Built-in interpreter server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuiltInConfig {
    pub php_binary: String,
    pub bind_host: String,

    /// Memory checker wrapping the interpreter when enabled
    pub memory_checker: String,

    /// Suppressions file name inside the test library directory
    pub suppressions_file: String,
}

impl Default for BuiltInConfig {
    fn default() -> Self {
        Self {
            php_binary: "php".to_string(),
            bind_host: "127.0.0.1".to_string(),
            memory_checker: "valgrind".to_string(),
            suppressions_file: "valgrind.supp".to_string(),
        }
    }
}

/// Process manager behind a reverse proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FpmProxyConfig {
    pub nginx_binary: String,
    pub fpm_binary: PathBuf,
    pub nginx_conf: PathBuf,

    /// Directory the proxy includes per-site configs from
    pub site_dir: PathBuf,

    /// Directory for generated per-scenario pool configs
    pub pool_dir: PathBuf,

    pub socket_dir: PathBuf,
    pub fpm_log_dir: PathBuf,
    pub nginx_log_dir: PathBuf,

    /// User the proxy workers and pools run as
    pub run_as: String,

    /// Upper bound for the proxy to show up after launch
    pub startup_wait_ms: u64,
}

impl Default for FpmProxyConfig {
    fn default() -> Self {
        Self {
            nginx_binary: "nginx".to_string(),
            fpm_binary: PathBuf::from("/usr/sbin/php-fpm"),
            nginx_conf: PathBuf::from("/etc/nginx/nginx.conf"),
            site_dir: PathBuf::from("/etc/nginx/conf.d"),
            pool_dir: PathBuf::from("/tmp/server-tests-fpm"),
            socket_dir: PathBuf::from("/run/php-fpm"),
            fpm_log_dir: PathBuf::from("/var/log/php-fpm"),
            nginx_log_dir: PathBuf::from("/var/log/nginx"),
            run_as: "root".to_string(),
            startup_wait_ms: 5_000,
        }
    }
}

/// Worker-pool runtime, shared by the classic and pooled modes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrankenPhpConfig {
    pub binary: String,

    /// Interpreter probed for its version when writing the Caddyfile
    pub php_binary: String,

    pub classic_caddyfile: PathBuf,
    pub worker_caddyfile: PathBuf,
    pub log_dir: PathBuf,
    pub php_ini_dir: PathBuf,
    pub worker_scripts_dir: PathBuf,

    /// Workers per site in pooled mode
    pub workers_per_site: usize,

    pub classic_startup_wait_ms: u64,
    pub worker_startup_wait_ms: u64,
}

impl Default for FrankenPhpConfig {
    fn default() -> Self {
        Self {
            binary: "frankenphp".to_string(),
            php_binary: "php".to_string(),
            classic_caddyfile: PathBuf::from("/tmp/frankenphp_test.caddyfile"),
            worker_caddyfile: PathBuf::from("/tmp/frankenphp_worker_test.caddyfile"),
            log_dir: PathBuf::from("/var/log/frankenphp"),
            php_ini_dir: PathBuf::from("/etc/frankenphp/php.d"),
            worker_scripts_dir: PathBuf::from("/tmp/frankenphp_workers"),
            workers_per_site: 2,
            classic_startup_wait_ms: 20_000,
            worker_startup_wait_ms: 2_000,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> HarnessResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.mock_command.is_empty() {
            return Err(HarnessError::InvalidConfig(
                "mock_command must not be empty".to_string(),
            ));
        }
        if self.max_parallel == 0 {
            return Err(HarnessError::InvalidConfig(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = HarnessConfig::load(Path::new("/nonexistent/harness.toml")).unwrap();
        assert_eq!(config.script.timeout_secs, 600);
        assert_eq!(config.timing.readiness, Readiness::FixedDelay);
        assert_eq!(config.agent.token, "AIK_RUNTIME_MOCK");
    }

    #[test]
    fn test_partial_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(
            &path,
            r#"
mock_command = ["/opt/bin/mock-core", "--liveness-delay-ms", "10"]
max_parallel = 4

[timing]
mock_grace_ms = 250
readiness = "probe"

[frankenphp]
workers_per_site = 4
"#,
        )
        .unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.timing.mock_grace(), Duration::from_millis(250));
        assert_eq!(config.timing.server_grace_ms, 5_000);
        assert_eq!(config.timing.readiness, Readiness::Probe);
        assert_eq!(config.frankenphp.workers_per_site, 4);
        assert_eq!(config.script.interpreter, "python3");
        assert_eq!(config.mock_sweep_pattern, "mock-core");
    }

    #[test]
    fn test_interpreter_wrapped_mock_keeps_sweep_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "mock_command = [\"python3\", \"mock_aikido_core.py\"]\n").unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.mock_command[0], "python3");
        assert_eq!(config.mock_sweep_pattern, "mock-core");

        std::fs::write(
            &path,
            "mock_command = [\"python3\", \"mock_aikido_core.py\"]\nmock_sweep_pattern = \"mock_aikido_core.py\"\n",
        )
        .unwrap();
        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.mock_sweep_pattern, "mock_aikido_core.py");
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "max_parallel = 0\n").unwrap();
        assert!(matches!(
            HarnessConfig::load(&path),
            Err(HarnessError::InvalidConfig(_))
        ));
    }
}
