//! Shared worker-pool runtime, in classic or pooled mode
//!
//! Both modes write one Caddyfile holding a site block per scenario and run a
//! single `frankenphp` process for the whole suite. Pooled mode additionally
//! generates a request-dispatch script per scenario that the runtime keeps
//! loaded between requests.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{clear_dir, ensure_dir, remove_file_if_exists, Backend, BackendKind};
use crate::config::FrankenPhpConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::process::{self, ProcessHandle, ProcessMatch};
use crate::scenario::PreparedScenario;

/// Runtime releases without global options support
const LEGACY_PHP_VERSION: (u32, u32) = (8, 2);

/// Assumed when the interpreter cannot be queried
const FALLBACK_PHP_VERSION: (u32, u32) = (8, 3);

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Every request runs the target script from scratch
    Classic,
    /// Long-lived dispatch scripts handle requests in a loop
    Pooled,
}

impl WorkerMode {
    /// Threads reserved per scenario and the ceiling multiplier
    fn thread_sizing(&self) -> (usize, usize) {
        match self {
            WorkerMode::Classic => (2, 1),
            WorkerMode::Pooled => (3, 2),
        }
    }
}

pub struct FrankenPhpBackend {
    mode: WorkerMode,
    cfg: FrankenPhpConfig,
    poll: Duration,
    mock_sweep_pattern: String,
    shared: Mutex<Option<ProcessHandle>>,
}

impl FrankenPhpBackend {
    pub fn new(
        mode: WorkerMode,
        cfg: FrankenPhpConfig,
        poll: Duration,
        mock_sweep_pattern: String,
    ) -> Self {
        Self {
            mode,
            cfg,
            poll,
            mock_sweep_pattern,
            shared: Mutex::new(None),
        }
    }

    pub fn caddyfile(&self) -> &Path {
        match self.mode {
            WorkerMode::Classic => &self.cfg.classic_caddyfile,
            WorkerMode::Pooled => &self.cfg.worker_caddyfile,
        }
    }

    fn startup_wait(&self) -> Duration {
        match self.mode {
            WorkerMode::Classic => Duration::from_millis(self.cfg.classic_startup_wait_ms),
            WorkerMode::Pooled => Duration::from_millis(self.cfg.worker_startup_wait_ms),
        }
    }

    fn worker_script_path(&self, name: &str) -> PathBuf {
        self.cfg.worker_scripts_dir.join(format!("{}.php", name))
    }

    /// Site block serving `scenario`, pointing at `worker_script` in pooled mode.
    pub fn site_block(&self, scenario: &PreparedScenario, worker_script: Option<&Path>) -> String {
        let root = scenario.spec.dir.display().to_string();
        let mut env = String::new();
        if worker_script.is_some() {
            let _ = writeln!(env, "        env DOCUMENT_ROOT \"{}\"", root);
        }
        for (key, value) in &scenario.env {
            let _ = writeln!(env, "        env {} \"{}\"", key, value);
        }

        let worker = match worker_script {
            Some(script) => format!(
                "        worker {{\n            file {}\n            num {}\n        }}\n",
                script.display(),
                self.cfg.workers_per_site
            ),
            None => String::new(),
        };

        format!(
            "http://:{port} {{\n    root * {root}\n    php_server {{\n{env}{worker}    }}\n}}\n",
            port = scenario.server_port(),
        )
    }

    /// Complete Caddyfile for every scenario. `php_version` decides whether
    /// the global options block is emitted.
    pub fn render_caddyfile(&self, scenarios: &[PreparedScenario], php_version: (u32, u32)) -> String {
        let (per_scenario, ceiling) = self.mode.thread_sizing();
        let threads = scenarios.len() * per_scenario;

        let mut out = String::new();
        if php_version != LEGACY_PHP_VERSION {
            let _ = write!(
                out,
                "{{\n    frankenphp {{\n        num_threads {}\n        max_threads {}\n    }}\n}}\n",
                threads,
                threads * ceiling
            );
        }
        for scenario in scenarios {
            if let Some(block) = &scenario.artifacts.site_block {
                out.push('\n');
                out.push_str(block);
            }
        }
        out
    }

    fn preflight_error(&self, reason: impl Into<String>) -> HarnessError {
        HarnessError::PreflightFailed {
            backend: self.kind().to_string(),
            reason: reason.into(),
        }
    }
}

/// Dispatch script routing each request of one scenario to its target file.
pub fn worker_script(test_dir: &Path) -> String {
    format!(
        r#"<?php
$test_dir = '{dir}';

$handler = function() use ($test_dir) {{
    $uri = $_SERVER['REQUEST_URI'] ?? '/';
    $path = parse_url($uri, PHP_URL_PATH) ?: '/';

    if ($path === '/' || $path === '') {{
        $file = $test_dir . '/index.php';
    }} else {{
        $file = $test_dir . $path;
        if (!is_file($file)) {{
            $file = $test_dir . '/index.php';
        }}
    }}

    if (is_file($file)) {{
        include $file;
    }} else {{
        http_response_code(404);
        echo "Not Found";
    }}
}};

for ($running = frankenphp_handle_request($handler); $running; $running = frankenphp_handle_request($handler)) {{
    gc_collect_cycles();
}}
"#,
        dir = test_dir.display()
    )
}

/// Parse `major.minor` as printed by the interpreter.
pub fn parse_php_version(output: &str) -> Option<(u32, u32)> {
    let (major, minor) = output.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

async fn php_version(php_binary: &str) -> (u32, u32) {
    let output = Command::new(php_binary)
        .args(["-r", r#"echo PHP_MAJOR_VERSION.".".PHP_MINOR_VERSION;"#])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            parse_php_version(&String::from_utf8_lossy(&out.stdout)).unwrap_or(FALLBACK_PHP_VERSION)
        }
        Ok(out) => {
            warn!("{} exited with {}, assuming PHP {:?}", php_binary, out.status, FALLBACK_PHP_VERSION);
            FALLBACK_PHP_VERSION
        }
        Err(e) => {
            warn!("Could not run {}: {}, assuming PHP {:?}", php_binary, e, FALLBACK_PHP_VERSION);
            FALLBACK_PHP_VERSION
        }
    }
}

#[async_trait]
impl Backend for FrankenPhpBackend {
    fn kind(&self) -> BackendKind {
        match self.mode {
            WorkerMode::Classic => BackendKind::FrankenphpClassic,
            WorkerMode::Pooled => BackendKind::FrankenphpWorker,
        }
    }

    async fn initialize(&self, _tests_root: &Path) -> HarnessResult<()> {
        remove_file_if_exists(self.caddyfile())?;
        ensure_dir(&self.cfg.log_dir)?;
        ensure_dir(&self.cfg.php_ini_dir)?;
        if self.mode == WorkerMode::Pooled {
            ensure_dir(&self.cfg.worker_scripts_dir)?;
            clear_dir(&self.cfg.worker_scripts_dir)?;
        }
        Ok(())
    }

    fn process_scenario(&self, mut scenario: PreparedScenario) -> HarnessResult<PreparedScenario> {
        let script = match self.mode {
            WorkerMode::Classic => None,
            WorkerMode::Pooled => {
                let path = self.worker_script_path(scenario.name());
                std::fs::write(&path, worker_script(&scenario.spec.dir))?;
                debug!("Wrote dispatch script {}", path.display());
                Some(path)
            }
        };

        scenario.artifacts.site_block = Some(self.site_block(&scenario, script.as_deref()));
        scenario.artifacts.worker_script = script;
        Ok(scenario)
    }

    async fn pre_flight(&self, scenarios: &[PreparedScenario]) -> HarnessResult<()> {
        let runtime = process::process_name(&self.cfg.binary);
        process::kill_processes(&runtime, ProcessMatch::ExactName, true).await;
        if !self.mock_sweep_pattern.is_empty() {
            process::kill_processes(&self.mock_sweep_pattern, ProcessMatch::CommandLine, true).await;
        }
        if let Err(e) = clear_dir(&self.cfg.log_dir) {
            warn!("Could not clear {}: {}", self.cfg.log_dir.display(), e);
        }

        let version = php_version(&self.cfg.php_binary).await;
        let caddyfile = self.render_caddyfile(scenarios, version);
        std::fs::write(self.caddyfile(), caddyfile)?;
        info!(
            "Caddyfile {} prepared for {} scenario(s)",
            self.caddyfile().display(),
            scenarios.len()
        );

        let mut cmd = Command::new(&self.cfg.binary);
        cmd.arg("run")
            .arg("--config")
            .arg(self.caddyfile())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let handle = ProcessHandle::spawn(format!("{} ({})", self.cfg.binary, self.kind()), &mut cmd)?;
        *self.shared.lock().await = Some(handle);

        let budget = self.startup_wait();
        if !process::wait_for_process(&runtime, budget, self.poll).await {
            return Err(self.preflight_error(format!("{} not running after {:?}", runtime, budget)));
        }
        Ok(())
    }

    async fn start_server(
        &self,
        _scenario: &PreparedScenario,
        _lib_dir: &Path,
        _memory_checker: bool,
    ) -> HarnessResult<Option<ProcessHandle>> {
        Ok(None)
    }

    async fn teardown(&self) -> HarnessResult<()> {
        if let Some(mut handle) = self.shared.lock().await.take() {
            handle.terminate(SHUTDOWN_GRACE).await?;
        }
        process::kill_processes(&process::process_name(&self.cfg.binary), ProcessMatch::ExactName, true).await;

        remove_file_if_exists(self.caddyfile())?;
        if self.mode == WorkerMode::Pooled {
            clear_dir(&self.cfg.worker_scripts_dir)?;
        }
        Ok(())
    }
}
