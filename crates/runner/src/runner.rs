//! Single-scenario lifecycle: mock up, server up, script, teardown

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout_at};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::{HarnessConfig, Readiness};
use crate::error::{HarnessError, HarnessResult};
use crate::process::ProcessHandle;
use crate::scenario::{Outcome, PreparedScenario, ScenarioResult};

/// How long a failed script's output is collected after it exits
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Where a scenario is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioPhase {
    Starting,
    MockUp,
    ServerUp,
    ScriptRunning,
    Passed,
    Failed,
    TornDown,
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioPhase::Starting => "starting",
            ScenarioPhase::MockUp => "mock-up",
            ScenarioPhase::ServerUp => "server-up",
            ScenarioPhase::ScriptRunning => "script-running",
            ScenarioPhase::Passed => "passed",
            ScenarioPhase::Failed => "failed",
            ScenarioPhase::TornDown => "torn-down",
        };
        f.write_str(s)
    }
}

/// Per-invocation settings shared by every scenario
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Suite root holding one directory per scenario
    pub root_dir: PathBuf,

    /// Test library directory, prepended to the script's library path
    pub lib_dir: PathBuf,

    /// Run the suite-level benchmark script instead of each test script
    pub benchmark: bool,

    /// Wrap the web-serving process in the memory checker where supported
    pub memory_checker: bool,
}

/// Thread-safe sink for finished scenarios
#[derive(Debug, Default)]
pub struct ResultBook {
    results: Mutex<Vec<ScenarioResult>>,
}

impl ResultBook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, result: ScenarioResult) {
        self.results.lock().push(result);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.results.lock().iter().any(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every recorded result, sorted by scenario name.
    pub fn snapshot(&self) -> Vec<ScenarioResult> {
        let mut results = self.results.lock().clone();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }
}

/// Drives one scenario through its lifecycle
#[derive(Clone)]
pub struct ScenarioRunner {
    config: Arc<HarnessConfig>,
    backend: Arc<dyn Backend>,
    options: Arc<RunOptions>,
    results: Arc<ResultBook>,
}

impl ScenarioRunner {
    pub fn new(
        config: Arc<HarnessConfig>,
        backend: Arc<dyn Backend>,
        options: Arc<RunOptions>,
        results: Arc<ResultBook>,
    ) -> Self {
        Self {
            config,
            backend,
            options,
            results,
        }
    }

    pub fn results(&self) -> &Arc<ResultBook> {
        &self.results
    }

    /// Run `scenario` to completion. The result is recorded before teardown;
    /// teardown always runs and the scenario's ports are released afterwards.
    pub async fn run(&self, scenario: PreparedScenario) -> ScenarioResult {
        let started = Instant::now();
        let name = scenario.name().to_string();
        let mut handles: Vec<ProcessHandle> = Vec::new();

        info!(scenario = %name, phase = %ScenarioPhase::Starting, "Running {}", name);

        let outcome = match self.execute(&scenario, &mut handles).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::failed(e.to_string()),
        };

        let result = ScenarioResult {
            name: name.clone(),
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        match &result.outcome {
            Outcome::Passed => info!(scenario = %name, phase = %ScenarioPhase::Passed, "{} passed", name),
            Outcome::Failed { reason } => {
                error!(scenario = %name, phase = %ScenarioPhase::Failed, "{} failed: {}", name, reason)
            }
        }
        self.results.record(result.clone());

        self.teardown(&name, handles).await;
        drop(scenario);
        info!(scenario = %name, phase = %ScenarioPhase::TornDown, "{} torn down", name);

        result
    }

    async fn execute(
        &self,
        scenario: &PreparedScenario,
        handles: &mut Vec<ProcessHandle>,
    ) -> HarnessResult<Outcome> {
        let timing = &self.config.timing;

        handles.push(self.spawn_mock(scenario)?);
        self.await_ready(scenario.mock_port(), timing.mock_grace()).await;
        info!(
            scenario = %scenario.name(),
            phase = %ScenarioPhase::MockUp,
            "Mock server up on port {}",
            scenario.mock_port()
        );

        let server = self
            .backend
            .start_server(scenario, &self.options.lib_dir, self.options.memory_checker)
            .await?;
        handles.extend(server);
        self.await_ready(scenario.server_port(), timing.server_grace()).await;
        info!(
            scenario = %scenario.name(),
            phase = %ScenarioPhase::ServerUp,
            "{} serving on port {}",
            self.backend.kind(),
            scenario.server_port()
        );

        info!(scenario = %scenario.name(), phase = %ScenarioPhase::ScriptRunning, "Running script");
        self.run_script(scenario).await
    }

    fn spawn_mock(&self, scenario: &PreparedScenario) -> HarnessResult<ProcessHandle> {
        let (program, args) = self
            .config
            .mock_command
            .split_first()
            .ok_or_else(|| HarnessError::InvalidConfig("mock_command must not be empty".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(scenario.mock_port().to_string())
            .arg(&scenario.spec.start_config)
            .stdin(Stdio::null());

        ProcessHandle::spawn(
            format!("mock server for {} on port {}", scenario.name(), scenario.mock_port()),
            &mut cmd,
        )
    }

    /// Wait out `grace`, or return early once `port` accepts connections when
    /// probing is enabled.
    async fn await_ready(&self, port: u16, grace: Duration) {
        match self.config.timing.readiness {
            Readiness::FixedDelay => sleep(grace).await,
            Readiness::Probe => {
                if !probe_port(port, grace, self.config.timing.poll_interval()).await {
                    warn!("Port {} not accepting connections after {:?}", port, grace);
                }
            }
        }
    }

    fn script_command(&self, scenario: &PreparedScenario) -> (PathBuf, PathBuf) {
        let script = &self.config.script;
        if self.options.benchmark {
            let root = self.options.root_dir.clone();
            (root.join(&script.benchmark_script), root)
        } else {
            let dir = scenario.spec.dir.clone();
            (dir.join(&script.test_script), dir)
        }
    }

    async fn run_script(&self, scenario: &PreparedScenario) -> HarnessResult<Outcome> {
        let script_cfg = &self.config.script;
        let (script, cwd) = self.script_command(scenario);
        let lib_path = prefixed_path(
            &self.options.lib_dir,
            std::env::var_os(&script_cfg.lib_path_var).as_deref().and_then(|v| v.to_str()),
        );

        let mut cmd = Command::new(&script_cfg.interpreter);
        cmd.arg(&script)
            .arg(scenario.server_port().to_string())
            .arg(scenario.mock_port().to_string())
            .current_dir(&cwd)
            .env(&script_cfg.lib_path_var, lib_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| HarnessError::Spawn {
            what: format!("{} {}", script_cfg.interpreter, script.display()),
            reason: e.to_string(),
        })?;
        debug!(scenario = %scenario.name(), "Script {} started in {}", script.display(), cwd.display());

        let deadline = tokio::time::Instant::now() + self.config.script_timeout();
        let captured_out = Arc::new(Mutex::new(Vec::new()));
        let captured_err = Arc::new(Mutex::new(Vec::new()));
        let mut stdout = tokio::spawn(drain(child.stdout.take(), Arc::clone(&captured_out)));
        let mut stderr = tokio::spawn(drain(child.stderr.take(), Arc::clone(&captured_err)));

        let status = match timeout_at(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    scenario = %scenario.name(),
                    "Script exceeded {:?}, killing",
                    self.config.script_timeout()
                );
                child.kill().await?;
                stdout.abort();
                stderr.abort();
                return Ok(Outcome::timeout());
            }
        };

        if !status.success() {
            // Background children of the script may keep the pipes open
            let drain_deadline = deadline.min(tokio::time::Instant::now() + OUTPUT_GRACE);
            let drained = timeout_at(drain_deadline, async {
                let _ = (&mut stdout).await;
                let _ = (&mut stderr).await;
            })
            .await;
            if drained.is_err() {
                debug!(scenario = %scenario.name(), "Script output still open after exit, using what was captured");
            }
        }
        stdout.abort();
        stderr.abort();

        if status.success() {
            return Ok(Outcome::Passed);
        }

        let mut output = String::from_utf8_lossy(&captured_out.lock()).into_owned();
        output.push_str(&String::from_utf8_lossy(&captured_err.lock()));
        let output = output.trim();
        if output.is_empty() {
            Ok(Outcome::failed(format!("script exited with {}", status)))
        } else {
            Ok(Outcome::failed(output))
        }
    }

    async fn teardown(&self, name: &str, handles: Vec<ProcessHandle>) {
        let grace = self.config.timing.kill_grace();
        // Server first, then the mock it reports to
        for mut handle in handles.into_iter().rev() {
            if let Err(e) = handle.terminate(grace).await {
                warn!(scenario = %name, "Failed to stop {}: {}", handle.label(), e);
            }
        }
    }
}

/// `lib_dir` followed by any existing search path.
pub fn prefixed_path(lib_dir: &Path, existing: Option<&str>) -> String {
    match existing {
        Some(rest) if !rest.is_empty() => format!("{}:{}", lib_dir.display(), rest),
        _ => lib_dir.display().to_string(),
    }
}

/// Poll `port` on loopback until it accepts a connection or `budget` elapses.
pub async fn probe_port(port: u16, budget: Duration, poll: Duration) -> bool {
    let start = Instant::now();
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if start.elapsed() >= budget {
            return false;
        }
        sleep(poll).await;
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, sink: Arc<Mutex<Vec<u8>>>) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
        }
    }
}
