//! Suite orchestration: discovery, preparation, fan-out and the final report

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::backend::{Backend, BackendKind};
use crate::config::HarnessConfig;
use crate::error::HarnessResult;
use crate::ports::PortAllocator;
use crate::runner::{ResultBook, RunOptions, ScenarioRunner};
use crate::scenario::{Outcome, PreparedScenario, ScenarioArtifacts, ScenarioResult, ScenarioSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedScenario {
    pub name: String,
    pub reason: String,
}

/// Outcome of a whole suite run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub backend: BackendKind,
    pub total: usize,
    pub passed: Vec<String>,
    pub failed: Vec<FailedScenario>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<ScenarioResult>,
}

impl SuiteReport {
    pub fn from_results(backend: BackendKind, results: Vec<ScenarioResult>, elapsed: Duration) -> Self {
        let mut passed = Vec::new();
        let mut failed = Vec::new();
        for result in &results {
            match &result.outcome {
                Outcome::Passed => passed.push(result.name.clone()),
                Outcome::Failed { reason } => failed.push(FailedScenario {
                    name: result.name.clone(),
                    reason: reason.clone(),
                }),
            }
        }

        Self {
            backend,
            total: results.len(),
            passed,
            failed,
            duration_ms: elapsed.as_millis() as u64,
            finished_at: Utc::now(),
            results,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Human-readable pass/fail listing; empty sections are left out.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if !self.passed.is_empty() {
            out.push_str("Passed tests:\n");
            for name in &self.passed {
                let _ = writeln!(out, "\t- {}", name);
            }
        }
        if !self.failed.is_empty() {
            out.push_str("Failed tests:\n");
            for failed in &self.failed {
                let first_line = failed.reason.lines().next().unwrap_or_default();
                let _ = writeln!(out, "\t- {} ({})", failed.name, first_line);
            }
        }
        if self.is_success() {
            out.push_str("All tests passed!\n");
        } else {
            let names: Vec<&str> = self.failed.iter().map(|f| f.name.as_str()).collect();
            let _ = writeln!(out, "Found failed tests: {:?}", names);
        }
        out
    }

    pub fn write_json(&self, path: &Path) -> HarnessResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Write the JSON report when a path is given and return the suite
    /// verdict. A report that cannot be written is logged, not fatal.
    pub fn finish(&self, report_path: Option<&Path>) -> bool {
        if let Some(path) = report_path {
            match self.write_json(path) {
                Ok(()) => info!("Report written to {}", path.display()),
                Err(e) => error!("Failed to write report to {}: {}", path.display(), e),
            }
        }
        self.is_success()
    }
}

pub struct Orchestrator {
    config: Arc<HarnessConfig>,
    backend: Arc<dyn Backend>,
    ports: Arc<PortAllocator>,
    options: Arc<RunOptions>,
}

impl Orchestrator {
    pub fn new(config: HarnessConfig, backend: Arc<dyn Backend>, options: RunOptions) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            ports: PortAllocator::new(),
            options: Arc::new(options),
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Run every scenario under the suite root, or only `selector` when given.
    ///
    /// Backend initialization, scenario preparation and pre-flight complete
    /// before any scenario starts. A pre-flight failure aborts the run after
    /// tearing the backend down.
    pub async fn run(&self, selector: Option<&str>) -> HarnessResult<SuiteReport> {
        let started = Instant::now();
        let kind = self.backend.kind();
        let root = &self.options.root_dir;

        self.backend.initialize(root).await?;

        let specs = match selector {
            Some(name) => vec![ScenarioSpec::from_dir(&root.join(name), kind)?],
            None => ScenarioSpec::discover(root, kind)?,
        };
        info!("Found {} scenario(s) for {}", specs.len(), kind);

        let results = ResultBook::new();
        let mut prepared = Vec::with_capacity(specs.len());
        for spec in specs {
            let name = spec.name.clone();
            match self.prepare(spec) {
                Ok(scenario) => prepared.push(scenario),
                Err(e) => {
                    error!(scenario = %name, "Preparation failed: {}", e);
                    results.record(ScenarioResult {
                        name,
                        outcome: Outcome::failed(e.to_string()),
                        duration_ms: 0,
                    });
                }
            }
        }

        if let Err(e) = self.backend.pre_flight(&prepared).await {
            error!("Pre-flight failed: {}", e);
            self.teardown_backend().await;
            return Err(e);
        }

        let runner = ScenarioRunner::new(
            Arc::clone(&self.config),
            Arc::clone(&self.backend),
            Arc::clone(&self.options),
            Arc::clone(&results),
        );

        if selector.is_some() {
            for scenario in prepared {
                runner.run(scenario).await;
            }
        } else {
            self.fan_out(&runner, prepared).await;
        }

        self.teardown_backend().await;

        let report = SuiteReport::from_results(kind, results.snapshot(), started.elapsed());
        info!(
            "{} passed, {} failed ({} ms)",
            report.passed.len(),
            report.failed.len(),
            report.duration_ms
        );
        Ok(report)
    }

    fn prepare(&self, spec: ScenarioSpec) -> HarnessResult<PreparedScenario> {
        let ports = self.ports.allocate_pair();
        let env = spec.server_env(&self.config.agent, ports.mock.port())?;
        let scenario = PreparedScenario {
            spec,
            ports,
            env,
            artifacts: ScenarioArtifacts::default(),
        };
        self.backend.process_scenario(scenario)
    }

    /// One task per scenario, at most `max_parallel` running at once. Blocks
    /// until every task has joined.
    async fn fan_out(&self, runner: &ScenarioRunner, prepared: Vec<PreparedScenario>) {
        let permits = Arc::new(Semaphore::new(self.config.max_parallel));
        let mut workers = Vec::with_capacity(prepared.len());

        for scenario in prepared {
            let name = scenario.name().to_string();
            let runner = runner.clone();
            let permits = Arc::clone(&permits);
            let worker = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                runner.run(scenario).await
            });
            workers.push((name, worker));
        }

        for (name, worker) in workers {
            if let Err(e) = worker.await {
                error!(scenario = %name, "Worker died: {}", e);
                if !runner.results().contains(&name) {
                    runner.results().record(ScenarioResult {
                        name,
                        outcome: Outcome::failed(format!("worker died: {}", e)),
                        duration_ms: 0,
                    });
                }
            }
        }
    }

    async fn teardown_backend(&self) {
        if let Err(e) = self.backend.teardown().await {
            warn!("Backend teardown failed: {}", e);
        }
    }
}
